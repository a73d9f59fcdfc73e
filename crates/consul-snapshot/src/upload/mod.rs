//! Snapshot delivery with fixed-interval bounded retry.

use std::time::Duration;

use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::error::{Error, ErrorKind, Result};
use crate::snapshot::SnapshotBlob;
use crate::target::{ObjectStorageTarget, TargetDescriptor, UploadTarget};

pub mod s3;

pub use s3::{AwsCliFactory, AwsCliObjectStore};

pub trait ObjectStore {
    /// Store `body` at `bucket`/`key`. Each call is one attempt.
    fn put_object(&self, bucket: &str, key: &str, body: &[u8], sha256: &str) -> Result<()>;
}

/// Builds provider clients from target information alone (no network).
pub trait ObjectStoreFactory {
    fn object_store(&self, target: &ObjectStorageTarget) -> Result<Box<dyn ObjectStore>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub succeeded: bool,
    pub attempts: u32,
    pub final_error: Option<ErrorKind>,
    pub remote_path: Option<String>,
    pub last_error: Option<String>,
}

impl UploadOutcome {
    fn failed(attempts: u32, kind: ErrorKind, err: &Error) -> Self {
        Self {
            succeeded: false,
            attempts,
            final_error: Some(kind),
            remote_path: None,
            last_error: Some(err.to_string()),
        }
    }

    pub fn into_result(self) -> Result<Self> {
        if self.succeeded {
            return Ok(self);
        }
        let kind = self.final_error.unwrap_or(ErrorKind::UploadExhausted);
        let detail = self.last_error.clone().unwrap_or_default();
        let msg = match kind {
            ErrorKind::UploadExhausted => {
                format!("error uploading snapshot after {} attempts: {detail}", self.attempts)
            }
            _ => format!("error uploading snapshot: {detail}"),
        };
        Err(Error::new(kind, msg))
    }
}

pub struct Dispatcher<'a> {
    factory: &'a dyn ObjectStoreFactory,
    policy: RetryPolicy,
    cancel: CancelToken,
}

impl<'a> Dispatcher<'a> {
    pub fn new(factory: &'a dyn ObjectStoreFactory, policy: RetryPolicy, cancel: CancelToken) -> Self {
        Self {
            factory,
            policy,
            cancel,
        }
    }

    pub fn upload(
        &self,
        target: &TargetDescriptor,
        artifact_name: &str,
        blob: &SnapshotBlob,
    ) -> UploadOutcome {
        let resolved = match UploadTarget::resolve(target) {
            Ok(t) => t,
            Err(e) => return UploadOutcome::failed(0, e.kind(), &e),
        };
        match resolved {
            UploadTarget::ObjectStorage(s3) => self.upload_object(&s3, artifact_name, blob),
        }
    }

    fn upload_object(
        &self,
        target: &ObjectStorageTarget,
        artifact_name: &str,
        blob: &SnapshotBlob,
    ) -> UploadOutcome {
        let store = match self.factory.object_store(target) {
            Ok(s) => s,
            Err(e) => return UploadOutcome::failed(0, e.kind(), &e),
        };
        let key = target.object_key(artifact_name);
        let remote = target.remote_path(&key);
        info!(remote = %remote, bytes = blob.len(), "uploading snapshot to s3");

        let total = self.policy.max_retries.saturating_add(1);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let err = match store.put_object(&target.bucket, &key, blob.bytes(), blob.sha256()) {
                Ok(()) => {
                    info!(
                        attempts,
                        "saved snapshot to bucket {} at path {}", target.bucket, key
                    );
                    return UploadOutcome {
                        succeeded: true,
                        attempts,
                        final_error: None,
                        remote_path: Some(remote),
                        last_error: None,
                    };
                }
                Err(e) => e,
            };
            if attempts >= total {
                return UploadOutcome::failed(attempts, ErrorKind::UploadExhausted, &err);
            }
            warn!(
                "error uploading to s3 ({err}), retrying in {:?} for retry {}/{}",
                self.policy.interval, attempts, self.policy.max_retries
            );
            if let Err(e) = self.cancel.sleep(self.policy.interval) {
                return UploadOutcome::failed(attempts, e.kind(), &e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::parse_target;
    use chrono::Utc;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Flaky {
        failures_left: Rc<Cell<u32>>,
        calls: Rc<Cell<u32>>,
    }

    impl ObjectStore for Flaky {
        fn put_object(&self, _bucket: &str, _key: &str, _body: &[u8], _sha: &str) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            if self.failures_left.get() > 0 {
                self.failures_left.set(self.failures_left.get() - 1);
                return Err(Error::msg("503 slow down"));
            }
            Ok(())
        }
    }

    struct FlakyFactory {
        failures: u32,
        calls: Rc<Cell<u32>>,
    }

    impl ObjectStoreFactory for FlakyFactory {
        fn object_store(&self, _t: &ObjectStorageTarget) -> Result<Box<dyn ObjectStore>> {
            Ok(Box::new(Flaky {
                failures_left: Rc::new(Cell::new(self.failures)),
                calls: self.calls.clone(),
            }))
        }
    }

    fn quick() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn recovers_on_third_attempt() {
        let calls = Rc::new(Cell::new(0));
        let factory = FlakyFactory {
            failures: 2,
            calls: calls.clone(),
        };
        let target = parse_target("s3://bucket/prefix").expect("target");
        let blob = SnapshotBlob::new(vec![1, 2, 3], Utc::now());
        let out = Dispatcher::new(&factory, quick(), CancelToken::new()).upload(&target, "1.snap", &blob);
        assert!(out.succeeded);
        assert_eq!(out.attempts, 3);
        assert_eq!(calls.get(), 3);
        assert_eq!(out.remote_path.as_deref(), Some("s3://bucket/prefix/1.snap"));
    }

    #[test]
    fn cancelled_between_attempts() {
        let calls = Rc::new(Cell::new(0));
        let factory = FlakyFactory {
            failures: 10,
            calls: calls.clone(),
        };
        let cancel = CancelToken::new();
        cancel.cancel();
        let target = parse_target("s3://bucket/prefix").expect("target");
        let blob = SnapshotBlob::new(vec![1], Utc::now());
        let out = Dispatcher::new(&factory, quick(), cancel).upload(&target, "1.snap", &blob);
        assert!(!out.succeeded);
        assert_eq!(out.attempts, 1);
        assert_eq!(out.final_error, Some(ErrorKind::Cancelled));
        assert_eq!(out.into_result().unwrap_err().kind(), ErrorKind::Cancelled);
    }
}
