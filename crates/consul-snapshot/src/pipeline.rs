use tracing::info;

use crate::cancel::CancelToken;
use crate::error::{Error, ErrorKind, Result};
use crate::snapshot::{ArtifactNamer, acquire_snapshot};
use crate::store::StoreClient;
use crate::target::{TargetDescriptor, UploadTarget};
use crate::upload::{Dispatcher, ObjectStoreFactory, RetryPolicy, UploadOutcome};
use crate::verify::{AgentLauncher, VerificationVerdict, Verifier, VerifyConfig};

/// Collaborators and knobs for one acquire, verify, upload run.
pub struct Pipeline<'a> {
    pub live: &'a dyn StoreClient,
    pub launcher: &'a dyn AgentLauncher,
    pub objects: &'a dyn ObjectStoreFactory,
    /// `None` skips verification.
    pub verify: Option<VerifyConfig>,
    pub retry: RetryPolicy,
    pub cancel: CancelToken,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub snapshot_bytes: usize,
    pub sha256: String,
    pub artifact: String,
    pub verdict: Option<VerificationVerdict>,
    pub upload: UploadOutcome,
}

impl RunReport {
    /// Machine-readable summary, written by `--report`.
    pub fn to_json(&self) -> serde_json::Value {
        let verification = match &self.verdict {
            Some(v) => serde_json::json!({
                "passed": v.passed,
                "live_keys": v.live_keys,
                "restored_keys": v.restored_keys,
                "live_total_bytes": v.live_total_bytes,
                "restored_total_bytes": v.restored_total_bytes,
            }),
            None => serde_json::Value::Null,
        };
        serde_json::json!({
            "artifact": self.artifact,
            "snapshot_bytes": self.snapshot_bytes,
            "sha256": self.sha256,
            "verification": verification,
            "upload": {
                "remote_path": self.upload.remote_path,
                "attempts": self.upload.attempts,
            },
        })
    }
}

fn verification_error(v: &VerificationVerdict) -> Error {
    let mut msg = format!(
        "snapshot verification failed: {}",
        v.reason.as_deref().unwrap_or("unknown reason")
    );
    if !v.missing_keys.is_empty() {
        const SHOWN: usize = 10;
        let listed: Vec<&str> = v.missing_keys.iter().take(SHOWN).map(String::as_str).collect();
        msg.push_str(&format!(" (missing: {}", listed.join(", ")));
        if v.missing_keys.len() > SHOWN {
            msg.push_str(&format!(", +{} more", v.missing_keys.len() - SHOWN));
        }
        msg.push(')');
    }
    Error::new(ErrorKind::VerificationFailed, msg)
}

impl Pipeline<'_> {
    pub fn run(&self, target: &TargetDescriptor) -> Result<RunReport> {
        // Reject unusable targets before touching the network.
        UploadTarget::resolve(target)?;

        let blob = acquire_snapshot(self.live)?;
        self.cancel.check()?;

        let verdict = match &self.verify {
            Some(cfg) => {
                let mut verifier = Verifier::new(self.launcher, cfg.clone(), self.cancel.clone());
                let verdict = verifier.verify(self.live, &blob)?;
                if !verdict.passed {
                    return Err(verification_error(&verdict));
                }
                Some(verdict)
            }
            None => {
                info!("snapshot verification skipped");
                None
            }
        };
        self.cancel.check()?;

        let artifact = ArtifactNamer::default().name_for(blob.captured_at());
        let upload = Dispatcher::new(self.objects, self.retry, self.cancel.clone())
            .upload(target, &artifact, &blob)
            .into_result()?;

        Ok(RunReport {
            snapshot_bytes: blob.len(),
            sha256: blob.sha256().to_string(),
            artifact,
            verdict,
            upload,
        })
    }
}
