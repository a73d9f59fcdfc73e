#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use consul_snapshot::store::{KeyRecord, StoreClient};
use consul_snapshot::target::ObjectStorageTarget;
use consul_snapshot::upload::{ObjectStore, ObjectStoreFactory, RetryPolicy};
use consul_snapshot::verify::{AgentLauncher, EphemeralAgent, VerifyConfig};
use consul_snapshot::{Error, ErrorKind, Result};

pub fn records(items: &[(&str, u64)]) -> Vec<KeyRecord> {
    items.iter().map(|(k, n)| KeyRecord::new(*k, *n)).collect()
}

pub fn fast_verify() -> VerifyConfig {
    VerifyConfig {
        readiness_grace: Duration::ZERO,
        readiness_timeout: Duration::from_millis(200),
        readiness_poll: Duration::from_millis(5),
        ..VerifyConfig::default()
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        interval: Duration::from_millis(1),
    }
}

/// In-memory stand-in for a Consul endpoint.
#[derive(Default)]
pub struct FakeStore {
    pub snapshot: Vec<u8>,
    pub kv: RefCell<Vec<KeyRecord>>,
    /// Key space a restore loads into `kv`.
    pub restore_yields: Vec<KeyRecord>,
    pub restored_bytes: RefCell<Option<Vec<u8>>>,
    /// `leader()` answers `None` this many times before reporting a leader.
    pub leaderless_polls: Cell<u32>,
    pub never_leader: bool,
    pub fail_save: bool,
    pub fail_restore: bool,
    pub fail_list: bool,
    pub calls: RefCell<Vec<&'static str>>,
}

impl FakeStore {
    pub fn live(kv: Vec<KeyRecord>) -> Self {
        Self {
            snapshot: b"fake-snapshot-archive".to_vec(),
            kv: RefCell::new(kv),
            ..Self::default()
        }
    }

    pub fn agent(restore_yields: Vec<KeyRecord>) -> Self {
        Self {
            restore_yields,
            ..Self::default()
        }
    }

    pub fn called(&self, what: &str) -> usize {
        self.calls.borrow().iter().filter(|c| **c == what).count()
    }
}

impl StoreClient for FakeStore {
    fn save_snapshot(&self) -> Result<Vec<u8>> {
        self.calls.borrow_mut().push("save");
        if self.fail_save {
            return Err(Error::msg("connection refused"));
        }
        Ok(self.snapshot.clone())
    }

    fn restore_snapshot(&self, snapshot: &[u8]) -> Result<()> {
        self.calls.borrow_mut().push("restore");
        if self.fail_restore {
            return Err(Error::msg("snapshot restore returned 500: unexpected EOF"));
        }
        *self.restored_bytes.borrow_mut() = Some(snapshot.to_vec());
        *self.kv.borrow_mut() = self.restore_yields.clone();
        Ok(())
    }

    fn list_keys(&self, _root: &str) -> Result<Vec<KeyRecord>> {
        self.calls.borrow_mut().push("list");
        if self.fail_list {
            return Err(Error::msg("kv list returned 403: ACL not found"));
        }
        Ok(self.kv.borrow().clone())
    }

    fn leader(&self) -> Result<Option<String>> {
        self.calls.borrow_mut().push("leader");
        if self.never_leader {
            return Ok(None);
        }
        let left = self.leaderless_polls.get();
        if left > 0 {
            self.leaderless_polls.set(left - 1);
            return Ok(None);
        }
        Ok(Some("127.0.0.1:8300".into()))
    }
}

pub struct FakeAgent {
    store: Rc<FakeStore>,
    exited: bool,
    teardowns: Rc<Cell<u32>>,
}

impl EphemeralAgent for FakeAgent {
    fn address(&self) -> &str {
        "http://127.0.0.1:18500"
    }

    fn client(&self) -> &dyn StoreClient {
        self.store.as_ref()
    }

    fn has_exited(&mut self) -> bool {
        self.exited
    }
}

impl Drop for FakeAgent {
    fn drop(&mut self) {
        self.teardowns.set(self.teardowns.get() + 1);
    }
}

pub struct FakeLauncher {
    pub store: Rc<FakeStore>,
    pub fail_launch: bool,
    pub exits_immediately: bool,
    pub launches: Cell<u32>,
    pub teardowns: Rc<Cell<u32>>,
}

impl FakeLauncher {
    pub fn new(store: FakeStore) -> Self {
        Self {
            store: Rc::new(store),
            fail_launch: false,
            exits_immediately: false,
            launches: Cell::new(0),
            teardowns: Rc::new(Cell::new(0)),
        }
    }
}

impl AgentLauncher for FakeLauncher {
    fn launch(&self) -> Result<Box<dyn EphemeralAgent>> {
        self.launches.set(self.launches.get() + 1);
        if self.fail_launch {
            return Err(Error::msg("failed to spawn \"consul\": No such file or directory"));
        }
        Ok(Box::new(FakeAgent {
            store: self.store.clone(),
            exited: self.exits_immediately,
            teardowns: self.teardowns.clone(),
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutCall {
    pub bucket: String,
    pub key: String,
    pub body: Vec<u8>,
    pub sha256: String,
}

/// Object store that fails the first `failures` puts and records every call.
pub struct RecordingFactory {
    pub failures: u32,
    pub puts: Rc<RefCell<Vec<PutCall>>>,
    pub built: Cell<u32>,
}

impl RecordingFactory {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            puts: Rc::new(RefCell::new(Vec::new())),
            built: Cell::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.puts.borrow().len()
    }
}

struct RecordingStore {
    failures_left: Cell<u32>,
    puts: Rc<RefCell<Vec<PutCall>>>,
}

impl ObjectStore for RecordingStore {
    fn put_object(&self, bucket: &str, key: &str, body: &[u8], sha256: &str) -> Result<()> {
        self.puts.borrow_mut().push(PutCall {
            bucket: bucket.into(),
            key: key.into(),
            body: body.to_vec(),
            sha256: sha256.into(),
        });
        let left = self.failures_left.get();
        if left > 0 {
            self.failures_left.set(left - 1);
            return Err(Error::new(ErrorKind::Io, "RequestTimeout: socket closed"));
        }
        Ok(())
    }
}

impl ObjectStoreFactory for RecordingFactory {
    fn object_store(&self, _target: &ObjectStorageTarget) -> Result<Box<dyn ObjectStore>> {
        self.built.set(self.built.get() + 1);
        Ok(Box::new(RecordingStore {
            failures_left: Cell::new(self.failures),
            puts: self.puts.clone(),
        }))
    }
}
