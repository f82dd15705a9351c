//! Logging in tests is important for troubleshooting, but works very differently then in
//! production.
use crate::Result;
use std::{
    cell::RefCell,
    future::Future,
    io::Write,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing_subscriber::fmt::MakeWriter;

/// An implementation of `MakeWriter` that captures all log events for a single test
#[derive(Clone)]
struct TestWriter {
    log_events: Arc<Mutex<Vec<u8>>>,
}

impl TestWriter {
    fn new() -> Self {
        Self {
            log_events: Arc::new(Mutex::new(Vec::<u8>::new())),
        }
    }

    /// Clear the writer's buffer, returning the current contents as a string
    /// Panics of non-UTF8 text has been written to the buffer
    fn take_string(&self) -> String {
        let mut guard = self.log_events.lock().unwrap();

        let buffer: Vec<u8> = std::mem::take(&mut guard);

        String::from_utf8(buffer).unwrap()
    }
}

impl<'a> Write for &'a TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.log_events.lock().unwrap();

        // Vec already implements Write
        guard.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for TestWriter {
    type Writer = &'a Self;

    fn make_writer(&'a self) -> Self::Writer {
        self
    }
}

/// Run a test with logging enabled.
///
/// This takes the place of `tokio::test` because it needs to initialize the tokio runtime in some
/// more customized way to ensure logging is done correctly.
///
/// It initializes a single `tracing` Dispatch object for this test only, as well as a dedicated
/// multi-threaded tokio runtime.  It configures `tracing` to log to a buffer, and dumps this
/// buffer to the console at the end of the test or in the event of a panic.  Importantly, and
/// unlike the default behavior you get when initializing tracing, this automatically initializes
/// all threads in the tokio runtime for this test, to use that same logging config.  So this will
/// pick up all log events in tokio async tasks as well, but only those for this specific test.
///
/// This makes the log output for each test much more actionable because it's not interspersed with
/// log events from other tests.
pub fn test_with_logging(test: impl Future<Output = Result<()>>) -> Result<()> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();

    run_test(builder, test)
}

/// Like [`test_with_logging`], but on a single-threaded runtime whose clock starts paused.
///
/// Sleeps complete instantly as soon as there's nothing else to do, so tests that make the code
/// under test wait (for `Retry-After` delays, for example) run without actually waiting.  This
/// only works if nothing in the test does real network I/O.
pub fn test_with_logging_paused_clock(test: impl Future<Output = Result<()>>) -> Result<()> {
    let mut builder = tokio::runtime::Builder::new_current_thread();
    builder.enable_all().start_paused(true);

    run_test(builder, test)
}

fn run_test(
    mut builder: tokio::runtime::Builder,
    test: impl Future<Output = Result<()>>,
) -> Result<()> {
    // All log events for this test will be stored in this vec.
    let test_writer = TestWriter::new();
    let dispatch = Arc::new(make_dispatch(test_writer.clone()));

    // This dispatch contains the logging config for this particular test.  It needs to be made the
    // default dispatcher in each thread as well.
    tracing::dispatcher::with_default(&dispatch, || {
        std::thread_local! {
            static THREAD_DISPATCHER_GUARD: RefCell<Option<tracing::subscriber::DefaultGuard>> = RefCell::new(None);
        }

        {
            let dispatch = dispatch.clone();
            builder.on_thread_start(move || {
                let dispatch = dispatch.clone();

                THREAD_DISPATCHER_GUARD.with(|cell| {
                    cell.replace(Some(tracing::dispatcher::set_default(&dispatch)));
                })
            });
        }

        builder.on_thread_stop(|| {
            // Drop the dispatcher guard so it's no longer the thread-local default
            THREAD_DISPATCHER_GUARD.with(|cell| cell.replace(None));
        });

        let runtime = builder.build()?;

        // It's not realistic to require all test futures to be explicitly unwind safe, so assume
        // they are.  Their state is discarded if they panic anyway.
        let result = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let result = runtime.block_on(test);
            runtime.shutdown_timeout(Duration::from_secs(10));

            result
        }));

        // Test has run, maybe succeed maybe failed maybe panicked
        // Print all of the log events now
        let log_events = test_writer.take_string();

        println!("Log events from this test: \n{}", log_events);

        match result {
            Ok(result) => result,
            Err(err) => {
                // Test panicked.  Just re-throw the panic now that we've written the log output
                std::panic::resume_unwind(err)
            }
        }
    })
}

fn make_dispatch(test_writer: TestWriter) -> tracing::Dispatch {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let format = fmt::layer()
        .with_level(true) // include level in output
        .with_target(true) // filters operate on targets so they're important to know
        .with_thread_ids(true) // thread IDs are helpful when multiple parallel tests are running at the same time
        .with_thread_names(false)
        .with_writer(test_writer);

    // Get the log filter from the RUST_LOG env var, or if not set use a reasonable default
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            EnvFilter::try_new("h2=warn,hyper=info,hyper_util=info,reqwest=info,rustls=info,debug")
        })
        .unwrap();

    let subscriber = tracing_subscriber::registry().with(filter).with(format);

    tracing::Dispatch::new(subscriber)
}
