//! Snapshot verification against an ephemeral agent.
//!
//! A [`Verifier`] starts a throwaway single-node agent, restores the captured
//! snapshot into it and compares its key space with the live cluster:
//!
//! - coverage: every live key must exist in the restored agent;
//! - size: summed value lengths must agree within a tolerance.
//!
//! Both checks always run and either one fails the verdict. Infrastructure
//! trouble (agent won't start, listing fails) is an error, not a verdict.

use std::collections::{BTreeSet, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::cancel::CancelToken;
use crate::error::{Error, ErrorKind, Result};
use crate::snapshot::SnapshotBlob;
use crate::store::{KeyRecord, StoreClient};

pub mod agent;

pub use agent::{ConsulDevAgent, ConsulDevLauncher};

pub const MISSING_KEYS_REASON: &str = "missing key(s) in restored snapshot";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyState {
    Idle,
    AgentStarting,
    AgentReady,
    Restoring,
    Comparing,
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationVerdict {
    pub passed: bool,
    pub missing_keys: BTreeSet<String>,
    pub live_keys: usize,
    pub restored_keys: usize,
    pub live_total_bytes: u64,
    pub restored_total_bytes: u64,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VerifyConfig {
    pub key_root: String,
    pub size_tolerance_bytes: u64,
    /// Unconditional wait before the first readiness probe.
    pub readiness_grace: Duration,
    pub readiness_timeout: Duration,
    pub readiness_poll: Duration,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            key_root: "/".into(),
            size_tolerance_bytes: 1000,
            readiness_grace: Duration::from_secs(2),
            readiness_timeout: Duration::from_secs(30),
            readiness_poll: Duration::from_millis(250),
        }
    }
}

/// A running, isolated store instance. Dropping it tears it down.
pub trait EphemeralAgent {
    fn address(&self) -> &str;
    fn client(&self) -> &dyn StoreClient;
    /// True once the underlying instance has stopped on its own.
    fn has_exited(&mut self) -> bool;
}

pub trait AgentLauncher {
    fn launch(&self) -> Result<Box<dyn EphemeralAgent>>;
}

/// Pure comparison of the live key space against the restored one.
pub fn compare_key_spaces(
    live: &[KeyRecord],
    restored: &[KeyRecord],
    size_tolerance_bytes: u64,
) -> VerificationVerdict {
    let restored_keys: HashSet<&str> = restored.iter().map(|r| r.key.as_str()).collect();
    let missing_keys: BTreeSet<String> = live
        .iter()
        .filter(|r| !restored_keys.contains(r.key.as_str()))
        .map(|r| r.key.clone())
        .collect();

    let live_total_bytes = live.iter().fold(0u64, |acc, r| acc.saturating_add(r.value_len));
    let restored_total_bytes = restored
        .iter()
        .fold(0u64, |acc, r| acc.saturating_add(r.value_len));

    let mut reasons = Vec::new();
    if !missing_keys.is_empty() {
        reasons.push(MISSING_KEYS_REASON.to_string());
    }
    if live_total_bytes.abs_diff(restored_total_bytes) > size_tolerance_bytes {
        reasons.push(format!(
            "different snapshot kv size detected, got {restored_total_bytes} expected {live_total_bytes} (tolerance {size_tolerance_bytes})"
        ));
    }

    VerificationVerdict {
        passed: reasons.is_empty(),
        missing_keys,
        live_keys: live.len(),
        restored_keys: restored.len(),
        live_total_bytes,
        restored_total_bytes,
        reason: (!reasons.is_empty()).then(|| reasons.join("; ")),
    }
}

/// Poll the agent's leader endpoint until it reports a leader.
pub fn wait_ready(
    agent: &mut dyn EphemeralAgent,
    cfg: &VerifyConfig,
    cancel: &CancelToken,
) -> Result<()> {
    cancel.sleep(cfg.readiness_grace)?;
    let deadline = Instant::now() + cfg.readiness_timeout;
    loop {
        if agent.has_exited() {
            return Err(Error::new(
                ErrorKind::VerificationSetup,
                format!(
                    "ephemeral agent at {} exited before becoming ready",
                    agent.address()
                ),
            ));
        }
        match agent.client().leader() {
            Ok(Some(leader)) => {
                debug!(leader = %leader, "ephemeral agent has a leader");
                return Ok(());
            }
            Ok(None) => debug!("ephemeral agent has no leader yet"),
            Err(e) => debug!("ephemeral agent not reachable yet: {e}"),
        }
        if Instant::now() >= deadline {
            return Err(Error::new(
                ErrorKind::VerificationSetup,
                format!(
                    "ephemeral agent at {} not ready after {:?}",
                    agent.address(),
                    cfg.readiness_timeout
                ),
            ));
        }
        cancel.sleep(cfg.readiness_poll)?;
    }
}

pub struct Verifier<'a> {
    launcher: &'a dyn AgentLauncher,
    cfg: VerifyConfig,
    cancel: CancelToken,
    state: VerifyState,
}

impl<'a> Verifier<'a> {
    pub fn new(launcher: &'a dyn AgentLauncher, cfg: VerifyConfig, cancel: CancelToken) -> Self {
        Self {
            launcher,
            cfg,
            cancel,
            state: VerifyState::Idle,
        }
    }

    pub fn state(&self) -> VerifyState {
        self.state
    }

    fn enter(&mut self, next: VerifyState) {
        debug!(from = ?self.state, to = ?next, "verification state");
        self.state = next;
    }

    /// Restore `snapshot` into a fresh agent and compare it with `live`.
    ///
    /// The agent is torn down before this returns, whatever the outcome.
    pub fn verify(
        &mut self,
        live: &dyn StoreClient,
        snapshot: &SnapshotBlob,
    ) -> Result<VerificationVerdict> {
        let result = self.run(live, snapshot);
        match &result {
            Ok(v) if v.passed => self.enter(VerifyState::Passed),
            _ => self.enter(VerifyState::Failed),
        }
        result
    }

    fn run(&mut self, live: &dyn StoreClient, snapshot: &SnapshotBlob) -> Result<VerificationVerdict> {
        self.enter(VerifyState::AgentStarting);
        let mut agent = self
            .launcher
            .launch()
            .map_err(|e| e.context(ErrorKind::VerificationSetup, "error starting ephemeral consul agent"))?;

        info!(address = agent.address(), "waiting for ephemeral consul agent to become ready");
        wait_ready(agent.as_mut(), &self.cfg, &self.cancel).map_err(|e| match e.kind() {
            ErrorKind::Cancelled | ErrorKind::VerificationSetup => e,
            _ => e.context(ErrorKind::VerificationSetup, "readiness wait"),
        })?;
        self.enter(VerifyState::AgentReady);

        info!("verifying snapshot by restoring to ephemeral consul agent");
        self.enter(VerifyState::Restoring);
        self.cancel.check()?;
        agent
            .client()
            .restore_snapshot(snapshot.bytes())
            .map_err(|e| e.context(ErrorKind::Restore, "error restoring snapshot to ephemeral agent"))?;

        self.enter(VerifyState::Comparing);
        let root = self.cfg.key_root.as_str();
        let restored = agent
            .client()
            .list_keys(root)
            .map_err(|e| e.context(ErrorKind::VerificationSetup, "error listing restored keys"))?;
        let live_keys = live
            .list_keys(root)
            .map_err(|e| e.context(ErrorKind::VerificationSetup, "error listing live keys"))?;
        drop(agent);

        let verdict = compare_key_spaces(&live_keys, &restored, self.cfg.size_tolerance_bytes);
        for k in &verdict.missing_keys {
            error!("key {k} was not found in the snapshot");
        }
        if verdict.passed {
            info!(
                keys = verdict.restored_keys,
                live_bytes = verdict.live_total_bytes,
                restored_bytes = verdict.restored_total_bytes,
                "verified all keys are contained within the snapshot, got {} keys",
                verdict.restored_keys
            );
        } else {
            error!(
                missing = verdict.missing_keys.len(),
                live_bytes = verdict.live_total_bytes,
                restored_bytes = verdict.restored_total_bytes,
                "snapshot verification failed: {}",
                verdict.reason.as_deref().unwrap_or_default()
            );
        }
        Ok(verdict)
    }
}
