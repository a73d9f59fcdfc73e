mod common;

use std::time::{Duration, Instant};

use chrono::Utc;
use consul_snapshot::ErrorKind;
use consul_snapshot::cancel::CancelToken;
use consul_snapshot::snapshot::SnapshotBlob;
use consul_snapshot::target::parse_target;
use consul_snapshot::upload::{Dispatcher, RetryPolicy};

use common::{RecordingFactory, fast_retry};

fn blob() -> SnapshotBlob {
    SnapshotBlob::new(b"consul-snapshot-bytes".to_vec(), Utc::now())
}

#[test]
fn first_attempt_success() {
    let factory = RecordingFactory::new(0);
    let target = parse_target("s3://bucket/prefix?region=us-east-1").expect("target");
    let blob = blob();
    let out = Dispatcher::new(&factory, fast_retry(), CancelToken::new()).upload(
        &target,
        "1700000000.snap",
        &blob,
    );
    assert!(out.succeeded);
    assert_eq!(out.attempts, 1);
    assert_eq!(out.final_error, None);
    assert_eq!(
        out.remote_path.as_deref(),
        Some("s3://bucket/prefix/1700000000.snap")
    );

    let puts = factory.puts.borrow();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].bucket, "bucket");
    assert_eq!(puts[0].key, "prefix/1700000000.snap");
    assert_eq!(puts[0].body, blob.bytes());
    assert_eq!(puts[0].sha256, blob.sha256());
}

#[test]
fn sustained_failure_exhausts_after_four_attempts() {
    let factory = RecordingFactory::new(u32::MAX);
    let target = parse_target("s3://bucket/prefix").expect("target");
    let blob = blob();
    let out =
        Dispatcher::new(&factory, fast_retry(), CancelToken::new()).upload(&target, "1.snap", &blob);
    assert!(!out.succeeded);
    assert_eq!(out.attempts, 4);
    assert_eq!(factory.attempts(), 4);
    assert_eq!(out.final_error, Some(ErrorKind::UploadExhausted));
    assert!(
        out.last_error
            .as_deref()
            .unwrap_or_default()
            .contains("RequestTimeout")
    );

    // Every attempt carried the full, unchanged payload.
    for put in factory.puts.borrow().iter() {
        assert_eq!(put.body, blob.bytes());
    }
    assert_eq!(blob.bytes(), b"consul-snapshot-bytes");

    let err = out.into_result().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UploadExhausted);
    assert!(err.to_string().contains("4 attempts"), "{err}");
}

#[test]
fn success_on_last_allowed_attempt() {
    let factory = RecordingFactory::new(3);
    let target = parse_target("s3://bucket").expect("target");
    let out =
        Dispatcher::new(&factory, fast_retry(), CancelToken::new()).upload(&target, "1.snap", &blob());
    assert!(out.succeeded);
    assert_eq!(out.attempts, 4);
    assert_eq!(out.remote_path.as_deref(), Some("s3://bucket/1.snap"));
}

#[test]
fn unsupported_provider_makes_no_attempt() {
    let factory = RecordingFactory::new(0);
    let target = parse_target("unsupported://bucket/prefix").expect("target");
    let out =
        Dispatcher::new(&factory, fast_retry(), CancelToken::new()).upload(&target, "1.snap", &blob());
    assert!(!out.succeeded);
    assert_eq!(out.attempts, 0);
    assert_eq!(out.final_error, Some(ErrorKind::UnsupportedProvider));
    assert_eq!(factory.built.get(), 0);
    assert_eq!(factory.attempts(), 0);
}

#[test]
fn waits_fixed_interval_between_attempts() {
    let factory = RecordingFactory::new(2);
    let target = parse_target("s3://bucket").expect("target");
    let policy = RetryPolicy {
        max_retries: 3,
        interval: Duration::from_millis(40),
    };
    let start = Instant::now();
    let out = Dispatcher::new(&factory, policy, CancelToken::new()).upload(&target, "1.snap", &blob());
    assert!(out.succeeded);
    assert_eq!(out.attempts, 3);
    assert!(start.elapsed() >= Duration::from_millis(80));
}

#[test]
fn zero_retries_means_single_attempt() {
    let factory = RecordingFactory::new(1);
    let target = parse_target("s3://bucket").expect("target");
    let policy = RetryPolicy {
        max_retries: 0,
        interval: Duration::from_millis(1),
    };
    let out = Dispatcher::new(&factory, policy, CancelToken::new()).upload(&target, "1.snap", &blob());
    assert!(!out.succeeded);
    assert_eq!(out.attempts, 1);
    assert_eq!(out.final_error, Some(ErrorKind::UploadExhausted));
}
