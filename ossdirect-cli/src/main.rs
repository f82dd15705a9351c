use clap::{ArgGroup, Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use ossdirect::{DownloadJobBuilder, DownloadTarget, StaticAccessToken, UploadJobBuilder, UploadSource};
use std::path::PathBuf;
use tracing::debug;

mod progress;

/// Upload and download large objects directly to and from object storage, through pre-signed URLs
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Operation to perform
    #[clap(subcommand)]
    command: Command,

    #[clap(flatten)]
    globals: Globals,

    #[clap(flatten)]
    config: ossdirect::Config,
}

/// Arguments that apply regardless of command
#[derive(Parser, Debug)]
struct Globals {
    /// The bearer token used to authorize requests for signed URLs.
    ///
    /// The token must be valid for the entire transfer; it's not refreshed.
    #[clap(
        long,
        env = "OSS_ACCESS_TOKEN",
        hide_env_values = true,
        global = true,
        value_name = "TOKEN"
    )]
    access_token: Option<String>,

    /// Enable verbose log output
    #[clap(short = 'v', long, conflicts_with = "quiet", global = true)]
    verbose: bool,

    /// Be quiet, suppress almost all output (except errors)
    #[clap(short = 'q', long, conflicts_with = "verbose", global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file (or stdin) as an object
    Upload {
        /// The file to upload, or "-" to upload whatever is read from stdin.
        #[clap(value_parser)]
        file: PathBuf,

        /// The bucket to upload the object to
        bucket: String,

        /// The key of the object to create.
        ///
        /// If not specified, the file name (without any directories) is used.  Required when
        /// uploading from stdin.
        object: Option<String>,

        /// The content type (MIME type) to record with the object
        #[clap(long, value_name = "MIME_TYPE")]
        content_type: Option<String>,
    },

    /// Download an object
    #[clap(group(ArgGroup::new("output").required(true)))]
    Download {
        /// The bucket containing the object
        bucket: String,

        /// The key of the object to download
        object: String,

        /// Write the object to a file, replacing it if it exists
        #[clap(short = 'f', long, value_parser, group = "output")]
        file: Option<PathBuf>,

        /// Write the object to stdout
        #[clap(short = 't', long, group = "output")]
        stdout: bool,
    },
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    init_logging(&args.globals)?;

    debug!(
        version = env!("CARGO_PKG_VERSION"),
        target = env!("VERGEN_CARGO_TARGET_TRIPLE"),
        "Starting"
    );

    let token = args
        .globals
        .access_token
        .clone()
        .map(StaticAccessToken::new)
        .ok_or_else(|| eyre!("An access token is required; use --access-token or set OSS_ACCESS_TOKEN"))?;

    match args.command {
        Command::Upload {
            file,
            bucket,
            object,
            content_type,
        } => {
            let (source, key) = if file.as_os_str() == "-" {
                let key = object
                    .ok_or_else(|| eyre!("The object key must be specified when uploading from stdin"))?;

                (UploadSource::Reader(Box::new(tokio::io::stdin())), key)
            } else {
                let key = match object {
                    Some(key) => key,
                    None => file
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .ok_or_else(|| eyre!("'{}' has no file name to use as the object key", file.display()))?,
                };

                (UploadSource::File(file), key)
            };

            let mut builder = UploadJobBuilder::new(args.config, token, &bucket, &key, source);
            if let Some(content_type) = content_type {
                builder.content_type(content_type);
            }

            let job = progress::with_spinner(&args.globals, "Preparing upload...", builder.build())
                .await
                .wrap_err("Invalid upload")?;

            let details = progress::run_upload_job(&args.globals, job).await?;

            if !args.globals.quiet {
                println!("{}", details.object_id);
            }
        }
        Command::Download {
            bucket,
            object,
            file,
            stdout,
        } => {
            let target = match (file, stdout) {
                (Some(path), false) => DownloadTarget::File(path),
                (None, true) => DownloadTarget::Writer(Box::new(tokio::io::stdout())),
                _ => unreachable!("BUG: clap should require exactly one output"),
            };

            let job = DownloadJobBuilder::new(args.config, token, &bucket, &object, target)
                .build()
                .wrap_err("Invalid download")?;

            progress::run_download_job(&args.globals, job, stdout).await?;
        }
    }

    Ok(())
}

/// Log to stderr, so that logging never gets mixed in with object data written to stdout
fn init_logging(globals: &Globals) -> color_eyre::Result<()> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let default_filter = if globals.verbose {
        "ossdirect=debug,info"
    } else if globals.quiet {
        "error"
    } else {
        "warn"
    };

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_filter))?;

    let format = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(globals.verbose)
        .with_timer(fmt::time::LocalTime::rfc_3339());

    tracing_subscriber::registry()
        .with(filter)
        .with(format)
        .try_init()
        .wrap_err("Failed to initialize logging")?;

    Ok(())
}
