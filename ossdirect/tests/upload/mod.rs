//! Upload jobs run against the fake object store, including the ways the object store and the
//! signed URLs fail.
use crate::Result;
use assert_matches::assert_matches;
use http::StatusCode;
use ossdirect::{ApiError, Config, OssDirectError, PartFailure, UploadJobBuilder, UploadSource};
use ossdirect_testing::fake_store::{PartAttempt, UploadUrlRequest};
use ossdirect_testing::logging::{test_with_logging, test_with_logging_paused_clock};
use ossdirect_testing::test_data::TestObject;
use ossdirect_testing::{FakeObjectStore, PartFault};
use std::time::Duration;

const BUCKET: &str = "test-bucket";

fn builder(
    store: &FakeObjectStore,
    config: Config,
    key: &str,
    source: impl Into<UploadSource>,
) -> UploadJobBuilder {
    let mut builder = UploadJobBuilder::new(config, store.token(), BUCKET, key, source);
    builder.transport(store.clone());

    builder
}

/// Upload `object` with the given config, returning the result of the job
async fn upload(
    store: &FakeObjectStore,
    config: Config,
    object: &TestObject,
) -> ossdirect::Result<ossdirect::ObjectDetails> {
    builder(store, config, &object.key, object.data.clone())
        .build()
        .await?
        .run_without_progress(futures::future::pending())
        .await
}

/// Config pointed at the fake with small parts, so tests with many parts don't need much data
fn small_chunk_config(store: &FakeObjectStore, chunk_size: u64, max_batch_size: usize) -> Config {
    Config {
        chunk_size: byte_unit::Byte::from_bytes(chunk_size as u128),
        max_batch_size,
        ..store.config()
    }
}

#[test]
fn uploads_in_parts() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        let object = TestObject::new("reports/twelve-megs.bin", "12MiB");

        let details = upload(&store, store.config(), &object).await?;

        assert_eq!(BUCKET, details.bucket_key);
        assert_eq!(object.key, details.object_key);
        assert_eq!(object.len(), details.size);

        // One batch with a URL for each of the three parts, and no retries
        assert_eq!(
            vec![UploadUrlRequest {
                parts: 3,
                first_part: 1,
                upload_key: None,
                minutes_expiration: None,
            }],
            store.upload_url_requests()
        );
        assert_eq!(
            vec![1, 2, 3],
            store
                .part_attempts()
                .into_iter()
                .map(|attempt| attempt.part_number)
                .collect::<Vec<_>>()
        );
        assert_eq!(1, store.completions().len());

        let stored = store.object(BUCKET, &object.key).unwrap();
        object.assert_matches(&stored.data);

        Ok(())
    })
}

#[test]
fn uploads_empty_object_as_one_part() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        let object = TestObject::new("empty", "0B");

        let details = upload(&store, store.config(), &object).await?;

        assert_eq!(0, details.size);
        assert_eq!(1, store.upload_url_requests()[0].parts);
        assert_eq!(
            vec![PartAttempt {
                part_number: 1,
                status: Some(StatusCode::OK)
            }],
            store.part_attempts()
        );
        assert!(store.object(BUCKET, "empty").unwrap().data.is_empty());

        Ok(())
    })
}

#[test]
fn requests_urls_in_batches() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        // 8 parts of 1 KiB, the last one partial
        let object = TestObject::new("batched", "7700B");
        let config = small_chunk_config(&store, 1024, 3);

        upload(&store, config, &object).await?;

        let requests = store.upload_url_requests();
        let upload_key = requests[0].upload_key.clone();
        assert_eq!(None, upload_key);

        let continuation_key = requests[1].upload_key.clone();
        assert!(continuation_key.is_some());

        assert_eq!(
            vec![(3, 1, None), (3, 4, continuation_key.clone()), (2, 7, continuation_key)],
            requests
                .into_iter()
                .map(|request| (request.parts, request.first_part, request.upload_key))
                .collect::<Vec<_>>()
        );

        // The upload key the URLs were issued with is the one the upload is completed with
        let completions = store.completions();
        assert_eq!(
            Some(completions[0].upload_key.clone()),
            store.upload_url_requests()[1].upload_key
        );

        let stored = store.object(BUCKET, &object.key).unwrap();
        object.assert_matches(&stored.data);

        Ok(())
    })
}

#[test]
fn expired_urls_are_replaced() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        let object = TestObject::new("expiring", "12MiB");
        store.fail_part(2, [PartFault::ExpireUrls]);

        upload(&store, store.config(), &object).await?;

        assert_eq!(1, store.attempts_for_part(1));
        assert_eq!(2, store.attempts_for_part(2));
        assert_eq!(1, store.attempts_for_part(3));

        // The second batch starts at the part whose URL expired, and continues the same upload
        let requests = store.upload_url_requests();
        assert_eq!(2, requests.len());
        assert_eq!(2, requests[1].first_part);
        assert_eq!(2, requests[1].parts);
        assert!(requests[1].upload_key.is_some());

        let stored = store.object(BUCKET, &object.key).unwrap();
        object.assert_matches(&stored.data);

        Ok(())
    })
}

#[test]
fn transient_failures_are_retried() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        let object = TestObject::new("flaky", "12MiB");
        store.fail_part(
            1,
            [
                PartFault::ConnectionReset,
                PartFault::Status(StatusCode::SERVICE_UNAVAILABLE),
            ],
        );
        store.fail_part(3, [PartFault::Status(StatusCode::INTERNAL_SERVER_ERROR)]);

        upload(&store, store.config(), &object).await?;

        assert_eq!(
            vec![
                PartAttempt {
                    part_number: 1,
                    status: None
                },
                PartAttempt {
                    part_number: 1,
                    status: Some(StatusCode::SERVICE_UNAVAILABLE)
                },
                PartAttempt {
                    part_number: 1,
                    status: Some(StatusCode::OK)
                },
                PartAttempt {
                    part_number: 2,
                    status: Some(StatusCode::OK)
                },
                PartAttempt {
                    part_number: 3,
                    status: Some(StatusCode::INTERNAL_SERVER_ERROR)
                },
                PartAttempt {
                    part_number: 3,
                    status: Some(StatusCode::OK)
                },
            ],
            store.part_attempts()
        );

        let stored = store.object(BUCKET, &object.key).unwrap();
        object.assert_matches(&stored.data);

        Ok(())
    })
}

#[test]
fn gives_up_after_max_retry_attempts() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        let object = TestObject::new("doomed", "12MiB");
        store.fail_part(
            2,
            std::iter::repeat(PartFault::Status(StatusCode::INTERNAL_SERVER_ERROR)).take(10),
        );

        let result = upload(&store, store.config(), &object).await;

        assert_matches!(
            result,
            Err(OssDirectError::RetryExhausted {
                part_number: 2,
                attempts: 5,
                source: PartFailure::PartStatus { status, .. },
                ..
            }) => {
                assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, status);
            }
        );
        assert_eq!(5, store.attempts_for_part(2));
        assert_eq!(0, store.attempts_for_part(3));

        // An upload that failed is never completed
        assert!(store.completions().is_empty());
        assert!(store.object(BUCKET, &object.key).is_none());

        Ok(())
    })
}

#[test]
fn stale_urls_count_toward_max_retry() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        let object = TestObject::new("stale", "3MiB");
        store.fail_part(1, std::iter::repeat(PartFault::ExpireUrls).take(3));

        let config = Config {
            max_retry: 3,
            ..store.config()
        };
        let result = upload(&store, config, &object).await;

        assert_matches!(
            result,
            Err(OssDirectError::RetryExhausted {
                part_number: 1,
                attempts: 3,
                source: PartFailure::StaleUrl,
                ..
            })
        );
        assert_eq!(3, store.upload_url_requests().len());

        Ok(())
    })
}

#[test]
fn rate_limiting_is_transparent() -> Result<()> {
    test_with_logging_paused_clock(async move {
        let store = FakeObjectStore::new();
        let object = TestObject::new("busy", "12MiB");
        store.rate_limit(3, Some("5"));

        let started = tokio::time::Instant::now();
        upload(&store, store.config(), &object).await?;

        assert_eq!(3, store.rate_limited_responses());
        assert!(started.elapsed() >= Duration::from_secs(15));

        // Waiting out the rate limit isn't a part failure
        assert_eq!(1, store.attempts_for_part(1));
        assert_eq!(1, store.upload_url_requests().len());

        Ok(())
    })
}

#[test]
fn rate_limit_without_retry_after_waits_one_second() -> Result<()> {
    test_with_logging_paused_clock(async move {
        let store = FakeObjectStore::new();
        let object = TestObject::new("busy", "1KiB");
        store.rate_limit(2, None);

        let started = tokio::time::Instant::now();
        upload(&store, store.config(), &object).await?;

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3));

        Ok(())
    })
}

#[test]
fn rate_limit_waits_are_bounded() -> Result<()> {
    test_with_logging_paused_clock(async move {
        let store = FakeObjectStore::new();
        let object = TestObject::new("busy", "1KiB");
        store.rate_limit(100, Some("1"));

        let config = Config {
            max_rate_limit_waits: 4,
            ..store.config()
        };
        let result = upload(&store, config, &object).await;

        assert_matches!(
            result,
            Err(OssDirectError::IssueUploadUrls {
                first_part: 1,
                source: ApiError::RateLimitExhausted { waits: 4, .. },
                ..
            })
        );
        assert_eq!(5, store.rate_limited_responses());
        assert!(store.part_attempts().is_empty());

        Ok(())
    })
}

#[test]
fn rejected_access_token_fails_immediately() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        store.set_access_token("some-other-token");
        let object = TestObject::new("unauthorized", "1KiB");

        let result = upload(&store, store.config(), &object).await;

        assert_matches!(
            result,
            Err(OssDirectError::IssueUploadUrls {
                source: ApiError::Unauthorized { status, .. },
                ..
            }) => {
                assert_eq!(StatusCode::UNAUTHORIZED, status);
            }
        );
        assert!(store.upload_url_requests().is_empty());

        Ok(())
    })
}

#[test]
fn completion_failure_is_reported() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        store.fail_completion(StatusCode::BAD_GATEWAY);
        let object = TestObject::new("incomplete", "6MiB");

        let result = upload(&store, store.config(), &object).await;

        assert_matches!(
            result,
            Err(OssDirectError::FinalizationFailed {
                source: ApiError::UnexpectedStatus { status, .. },
                ..
            }) => {
                assert_eq!(StatusCode::BAD_GATEWAY, status);
            }
        );

        // Every part was uploaded, but the completion was only tried once
        assert_eq!(2, store.part_attempts().len());
        assert_eq!(1, store.completions().len());
        assert!(store.object(BUCKET, &object.key).is_none());

        Ok(())
    })
}

#[test]
fn completion_is_not_retried_when_rate_limited() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        store.fail_completion(StatusCode::TOO_MANY_REQUESTS);
        let object = TestObject::new("incomplete", "1KiB");

        let result = upload(&store, store.config(), &object).await;

        assert_matches!(
            result,
            Err(OssDirectError::FinalizationFailed {
                source: ApiError::UnexpectedStatus { .. },
                ..
            })
        );
        assert_eq!(1, store.completions().len());

        Ok(())
    })
}

#[test]
fn content_type_is_recorded() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        let object = TestObject::new("report.pdf", "1KiB");

        let mut builder = builder(&store, store.config(), &object.key, object.data.clone());
        builder.content_type("application/pdf");
        let details = builder
            .build()
            .await?
            .run_without_progress(futures::future::pending())
            .await?;

        assert_eq!(Some("application/pdf"), details.content_type.as_deref());
        assert_eq!(
            Some("application/pdf".to_string()),
            store.completions()[0].content_type
        );
        assert_eq!(
            "application/pdf",
            store.object(BUCKET, &object.key).unwrap().content_type
        );

        // Without one, the header isn't sent at all
        let other = TestObject::new("no-type", "1KiB");
        upload(&store, store.config(), &other).await?;
        assert_eq!(None, store.completions()[1].content_type);

        Ok(())
    })
}

#[test]
fn url_expiration_is_requested() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        let object = TestObject::new("expiration", "4KiB");
        let config = Config {
            minutes_expiration: Some(15),
            ..small_chunk_config(&store, 1024, 2)
        };

        upload(&store, config, &object).await?;

        let requests = store.upload_url_requests();
        assert_eq!(2, requests.len());
        assert!(requests
            .iter()
            .all(|request| request.minutes_expiration == Some(15)));

        Ok(())
    })
}

#[test]
fn uploads_from_file() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        let object = TestObject::new("from-file", "11MiB");
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("source.bin");
        tokio::fs::write(&path, &object.data).await?;

        let job = builder(&store, store.config(), &object.key, UploadSource::File(path))
            .build()
            .await?;
        assert_eq!(Some(object.len()), job.total_bytes());
        assert_eq!(Some(3), job.total_parts());

        job.run_without_progress(futures::future::pending()).await?;

        let stored = store.object(BUCKET, &object.key).unwrap();
        object.assert_matches(&stored.data);

        Ok(())
    })
}

#[test]
fn missing_source_file_fails_build() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        let dir = tempfile::tempdir()?;

        let result = builder(
            &store,
            store.config(),
            "missing",
            UploadSource::File(dir.path().join("does-not-exist")),
        )
        .build()
        .await;

        assert_matches!(result, Err(OssDirectError::OpenSource { .. }));
        assert!(store.upload_url_requests().is_empty());

        Ok(())
    })
}

#[test]
fn uploads_from_reader() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        // 5 parts of 1 KiB, the last one partial
        let object = TestObject::new("from-reader", "4500B");
        let reader = std::io::Cursor::new(object.data.clone());

        let job = builder(
            &store,
            small_chunk_config(&store, 1024, 2),
            &object.key,
            UploadSource::Reader(Box::new(reader)),
        )
        .build()
        .await?;
        assert_eq!(None, job.total_bytes());
        assert_eq!(None, job.total_parts());

        job.run_without_progress(futures::future::pending()).await?;

        // The number of parts isn't known in advance, so every batch is full size
        assert_eq!(
            vec![(2, 1), (2, 3), (2, 5)],
            store
                .upload_url_requests()
                .into_iter()
                .map(|request| (request.parts, request.first_part))
                .collect::<Vec<_>>()
        );
        assert_eq!(5, store.part_attempts().len());

        let stored = store.object(BUCKET, &object.key).unwrap();
        object.assert_matches(&stored.data);

        Ok(())
    })
}

/// Upload a reader with the most parts the object store allows, one byte each, returning the
/// `(parts, first_part)` of every URL request
async fn upload_max_parts_from_reader(
    store: &FakeObjectStore,
    max_batch_size: usize,
) -> Result<Vec<(usize, usize)>> {
    let object = TestObject::new("ten-thousand-parts", "10000B");
    let reader = std::io::Cursor::new(object.data.clone());

    builder(
        store,
        small_chunk_config(store, 1, max_batch_size),
        &object.key,
        UploadSource::Reader(Box::new(reader)),
    )
    .build()
    .await?
    .run_without_progress(futures::future::pending())
    .await?;

    let stored = store.object(BUCKET, &object.key).unwrap();
    object.assert_matches(&stored.data);

    let requests = store
        .upload_url_requests()
        .into_iter()
        .map(|request| (request.parts, request.first_part))
        .collect::<Vec<_>>();
    for (parts, first_part) in &requests {
        assert!(
            first_part + parts - 1 <= 10_000,
            "{parts} URLs requested starting at part {first_part}"
        );
    }

    Ok(requests)
}

#[test]
fn reader_batches_stop_at_last_allowed_part() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();

        // 3 doesn't divide 10,000, so the last batch has just one URL
        let requests = upload_max_parts_from_reader(&store, 3).await?;

        assert_eq!(3_334, requests.len());
        assert_eq!(Some(&(3, 9_997)), requests.get(3_332));
        assert_eq!(Some(&(1, 10_000)), requests.last());
        assert_eq!(10_000, store.part_attempts().len());

        Ok(())
    })
}

#[test]
fn reader_refill_near_last_allowed_part() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        store.fail_part(9_999, [PartFault::ExpireUrls]);

        let requests = upload_max_parts_from_reader(&store, 3).await?;

        // The batch replacing the expired URLs starts at part 9,999 and only has room for 2
        assert_eq!(
            vec![(3, 9_997), (2, 9_999)],
            requests[requests.len() - 2..].to_vec()
        );
        assert_eq!(2, store.attempts_for_part(9_999));
        assert_eq!(1, store.attempts_for_part(10_000));

        Ok(())
    })
}

#[test]
fn oversized_chunk_size_is_rejected() -> Result<()> {
    test_with_logging(async move {
        let store = FakeObjectStore::new();
        let object = TestObject::new("tiny", "4B");
        let reader = std::io::Cursor::new(object.data.clone());

        // A petabyte per part is far past what the object store accepts
        let result = builder(
            &store,
            small_chunk_config(&store, 1 << 50, 25),
            &object.key,
            UploadSource::Reader(Box::new(reader)),
        )
        .build()
        .await;

        assert_matches!(result, Err(OssDirectError::InvalidConfig { .. }));
        assert!(store.upload_url_requests().is_empty());

        Ok(())
    })
}

#[test]
fn abort_stops_upload_before_completion() -> Result<()> {
    test_with_logging_paused_clock(async move {
        let store = FakeObjectStore::new();
        let object = TestObject::new("aborted", "1KiB");
        // The job will be waiting out this rate limit when the abort signal fires
        store.rate_limit(1, Some("30"));

        let result = builder(&store, store.config(), &object.key, object.data.clone())
            .build()
            .await?
            .run_without_progress(tokio::time::sleep(Duration::from_secs(10)))
            .await;

        assert_matches!(result, Err(OssDirectError::Aborted));
        assert!(store.part_attempts().is_empty());
        assert!(store.completions().is_empty());
        assert!(store.object(BUCKET, &object.key).is_none());

        Ok(())
    })
}
