//! Download jobs run against the fake object store, writing to each kind of download target.
use crate::Result;
use assert_matches::assert_matches;
use http::StatusCode;
use ossdirect::http::TransportError;
use ossdirect::{
    ApiError, Config, DownloadJobBuilder, DownloadTarget, DownloadedObject, OssDirectError,
    PartFailure, UploadJobBuilder,
};
use ossdirect_testing::fake_store::DownloadUrlRequest;
use ossdirect_testing::logging::{test_with_logging, test_with_logging_paused_clock};
use ossdirect_testing::test_data::TestObject;
use ossdirect_testing::FakeObjectStore;
use std::time::Duration;
use tokio::io::AsyncReadExt;

const BUCKET: &str = "test-bucket";

async fn download(
    store: &FakeObjectStore,
    config: Config,
    key: &str,
    target: DownloadTarget,
) -> ossdirect::Result<DownloadedObject> {
    let mut builder = DownloadJobBuilder::new(config, store.token(), BUCKET, key, target);
    builder.transport(store.clone());

    builder
        .build()?
        .run_without_progress(futures::future::pending())
        .await
}

#[test]
fn downloads_to_memory() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        let object = TestObject::new("in-memory", "3MiB");
        store.put_object(BUCKET, &object.key, object.data.clone());

        let downloaded = download(&store, store.config(), &object.key, DownloadTarget::Memory).await?;

        assert_eq!(object.len(), downloaded.size);
        object.assert_matches(downloaded.data.as_deref().unwrap());
        assert_eq!(1, store.download_gets());
        assert_eq!(
            vec![DownloadUrlRequest {
                minutes_expiration: None,
                use_cdn: false,
            }],
            store.download_url_requests()
        );

        Ok(())
    })
}

#[test]
fn downloads_to_file() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        let object = TestObject::new("to-file", "1MiB");
        store.put_object(BUCKET, &object.key, object.data.clone());

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("downloaded.bin");
        // An existing file is replaced
        tokio::fs::write(&path, b"previous contents which are longer than nothing").await?;

        let downloaded = download(
            &store,
            store.config(),
            &object.key,
            DownloadTarget::File(path.clone()),
        )
        .await?;

        assert_eq!(object.len(), downloaded.size);
        assert_eq!(None, downloaded.data);
        object.assert_matches_file(&path).await?;

        Ok(())
    })
}

#[test]
fn downloads_to_writer() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        let object = TestObject::new("to-writer", "2MiB");
        store.put_object(BUCKET, &object.key, object.data.clone());

        let (writer, mut reader) = tokio::io::duplex(64 * 1024);
        let reader = tokio::spawn(async move {
            let mut data = Vec::new();
            reader.read_to_end(&mut data).await?;

            Ok::<_, std::io::Error>(data)
        });

        download(
            &store,
            store.config(),
            &object.key,
            DownloadTarget::Writer(Box::new(writer)),
        )
        .await?;

        // The job shut down the writer and dropped it, so the reader is at EOF
        let data = reader.await??;
        object.assert_matches(&data);

        Ok(())
    })
}

#[test]
fn round_trip() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        let object = TestObject::new("round/trip/object.bin", "12MiB");

        let mut builder = UploadJobBuilder::new(
            store.config(),
            store.token(),
            BUCKET,
            &object.key,
            object.data.clone(),
        );
        builder.transport(store.clone());
        builder.content_type("application/octet-stream");
        builder
            .build()
            .await?
            .run_without_progress(futures::future::pending())
            .await?;

        let downloaded = download(&store, store.config(), &object.key, DownloadTarget::Memory).await?;

        object.assert_matches(downloaded.data.as_deref().unwrap());

        Ok(())
    })
}

/// Names of the entries in a directory
fn dir_entries(dir: &std::path::Path) -> Result<Vec<String>> {
    let mut names = std::fs::read_dir(dir)?
        .map(|entry| Ok(entry?.file_name().to_string_lossy().into_owned()))
        .collect::<Result<Vec<_>>>()?;
    names.sort();

    Ok(names)
}

#[test]
fn interrupted_download_leaves_file_untouched() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        let object = TestObject::new("interrupted", "1MiB");
        store.put_object(BUCKET, &object.key, object.data.clone());
        store.interrupt_downloads_after(200 * 1024);

        let dir = tempfile::tempdir()?;
        let existing = dir.path().join("existing.bin");
        let new = dir.path().join("new.bin");
        tokio::fs::write(&existing, b"previous contents").await?;

        for path in [&existing, &new] {
            let result = download(
                &store,
                store.config(),
                &object.key,
                DownloadTarget::File(path.clone()),
            )
            .await;

            assert_matches!(
                result,
                Err(OssDirectError::DownloadObject {
                    source: PartFailure::PartTransport {
                        source: TransportError::Connection { .. }
                    },
                    ..
                })
            );
        }

        // No partial object at either path, and no temporary files left behind
        assert_eq!(b"previous contents".to_vec(), tokio::fs::read(&existing).await?);
        assert_eq!(vec!["existing.bin".to_string()], dir_entries(dir.path())?);

        Ok(())
    })
}

#[test]
fn downloads_to_relative_file() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        let object = TestObject::new("relative", "100KiB");
        store.put_object(BUCKET, &object.key, object.data.clone());

        // A bare file name has an empty parent directory, which means the current directory
        let name = format!("ossdirect-relative-{}.bin", std::process::id());
        let path = std::path::PathBuf::from(&name);

        let result = download(
            &store,
            store.config(),
            &object.key,
            DownloadTarget::File(path.clone()),
        )
        .await;
        let contents = tokio::fs::read(&path).await;
        let _ = tokio::fs::remove_file(&path).await;

        result?;
        object.assert_matches(&contents?);

        Ok(())
    })
}

#[test]
fn empty_object() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        store.put_object(BUCKET, "empty", Vec::new());

        let downloaded = download(&store, store.config(), "empty", DownloadTarget::Memory).await?;

        assert_eq!(0, downloaded.size);
        assert_eq!(Some(bytes::Bytes::new()), downloaded.data);

        Ok(())
    })
}

#[test]
fn object_not_ready_isnt_downloaded() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        store.put_object(BUCKET, "processing", b"not yet".to_vec());
        store.set_object_status(BUCKET, "processing", "processing");

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("never-created.bin");

        let result = download(
            &store,
            store.config(),
            "processing",
            DownloadTarget::File(path.clone()),
        )
        .await;

        assert_matches!(
            result,
            Err(OssDirectError::ObjectNotReady { status, .. }) => {
                assert_eq!("processing", status);
            }
        );
        assert_eq!(0, store.download_gets());
        assert!(!path.exists(), "Target file shouldn't be created");

        Ok(())
    })
}

#[test]
fn missing_object() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();

        let result = download(&store, store.config(), "nope", DownloadTarget::Memory).await;

        assert_matches!(
            result,
            Err(OssDirectError::IssueDownloadUrl {
                source: ApiError::UnexpectedStatus { status, .. },
                ..
            }) => {
                assert_eq!(StatusCode::NOT_FOUND, status);
            }
        );
        assert_eq!(0, store.download_gets());

        Ok(())
    })
}

#[test]
fn cdn_and_expiration_are_requested() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        store.put_object(BUCKET, "cdn", b"served from the edge".to_vec());

        let config = Config {
            minutes_expiration: Some(60),
            use_cdn: true,
            ..store.config()
        };
        download(&store, config, "cdn", DownloadTarget::Memory).await?;

        assert_eq!(
            vec![DownloadUrlRequest {
                minutes_expiration: Some(60),
                use_cdn: true,
            }],
            store.download_url_requests()
        );

        Ok(())
    })
}

#[test]
fn rate_limited_download_url_request() -> Result<()> {
    test_with_logging_paused_clock(async move {
        let store = FakeObjectStore::new();
        let object = TestObject::new("busy", "100KiB");
        store.put_object(BUCKET, &object.key, object.data.clone());
        store.rate_limit(2, Some("3"));

        let started = tokio::time::Instant::now();
        let downloaded = download(&store, store.config(), &object.key, DownloadTarget::Memory).await?;

        assert!(started.elapsed() >= Duration::from_secs(6));
        assert_eq!(2, store.rate_limited_responses());
        object.assert_matches(downloaded.data.as_deref().unwrap());

        Ok(())
    })
}

#[test]
fn abort_stops_download() -> Result<()> {
    test_with_logging_paused_clock(async move {
        let store = FakeObjectStore::new();
        store.put_object(BUCKET, "aborted", b"never downloaded".to_vec());
        store.rate_limit(1, Some("30"));

        let mut builder = DownloadJobBuilder::new(
            store.config(),
            store.token(),
            BUCKET,
            "aborted",
            DownloadTarget::Memory,
        );
        builder.transport(store.clone());

        let result = builder
            .build()?
            .run_without_progress(tokio::time::sleep(Duration::from_secs(1)))
            .await;

        assert_matches!(result, Err(OssDirectError::Aborted));
        assert_eq!(0, store.download_gets());

        Ok(())
    })
}
