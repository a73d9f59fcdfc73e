use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{Error, ErrorKind, Result};
use crate::store::StoreClient;

/// Immutable in-memory snapshot. Clones share the same bytes.
#[derive(Debug, Clone)]
pub struct SnapshotBlob {
    bytes: Arc<[u8]>,
    captured_at: DateTime<Utc>,
    sha256: String,
}

impl SnapshotBlob {
    pub fn new(bytes: Vec<u8>, captured_at: DateTime<Utc>) -> Self {
        let sha256 = hex::encode(Sha256::digest(&bytes));
        Self {
            bytes: bytes.into(),
            captured_at,
            sha256,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Hex SHA-256 of the snapshot bytes.
    pub fn sha256(&self) -> &str {
        &self.sha256
    }
}

/// Capture a full-state snapshot from the live store. Never retried.
pub fn acquire_snapshot(store: &dyn StoreClient) -> Result<SnapshotBlob> {
    let captured_at = Utc::now();
    let bytes = store
        .save_snapshot()
        .map_err(|e| e.context(ErrorKind::Acquire, "error fetching consul snapshot"))?;
    if bytes.is_empty() {
        return Err(Error::new(
            ErrorKind::Acquire,
            "consul returned an empty snapshot",
        ));
    }
    let blob = SnapshotBlob::new(bytes, captured_at);
    info!(
        bytes = blob.len(),
        sha256 = blob.sha256(),
        "got snapshot of {} bytes",
        blob.len()
    );
    Ok(blob)
}

/// Names artifacts `{unix_seconds}.snap`, suffixing `-N` when a run asks twice
/// within the same second (or the clock steps back).
#[derive(Debug, Default)]
pub struct ArtifactNamer {
    last: Option<(i64, u32)>,
}

impl ArtifactNamer {
    pub fn name_for(&mut self, at: DateTime<Utc>) -> String {
        let ts = at.timestamp();
        let next = match self.last {
            Some((last_ts, n)) if ts <= last_ts => (last_ts, n + 1),
            _ => (ts, 0),
        };
        self.last = Some(next);
        match next {
            (ts, 0) => format!("{ts}.snap"),
            (ts, n) => format!("{ts}-{n}.snap"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn blob_digest_matches_bytes() {
        let blob = SnapshotBlob::new(b"abc".to_vec(), Utc::now());
        assert_eq!(blob.len(), 3);
        assert_eq!(
            blob.sha256(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let clone = blob.clone();
        assert!(std::ptr::eq(clone.bytes().as_ptr(), blob.bytes().as_ptr()));
    }

    #[test]
    fn artifact_names_stay_unique_within_a_run() {
        let mut namer = ArtifactNamer::default();
        let t = Utc.timestamp_opt(1_700_000_000, 0).single().expect("ts");
        assert_eq!(namer.name_for(t), "1700000000.snap");
        assert_eq!(namer.name_for(t), "1700000000-1.snap");
        let earlier = Utc.timestamp_opt(1_699_999_999, 0).single().expect("ts");
        assert_eq!(namer.name_for(earlier), "1700000000-2.snap");
        let later = Utc.timestamp_opt(1_700_000_005, 0).single().expect("ts");
        assert_eq!(namer.name_for(later), "1700000005.snap");
    }
}
