use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use reqwest::Url;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::process::{kill_pgroup, spawn_grouped};
use crate::store::{ConsulClient, ConsulConfig, StoreClient};
use crate::verify::{AgentLauncher, EphemeralAgent};

const LOOPBACK: &str = "127.0.0.1";

/// Launches `consul agent -dev` instances bound to loopback on free ports.
#[derive(Debug, Clone)]
pub struct ConsulDevLauncher {
    pub consul_bin: PathBuf,
    pub tls_skip_verify: bool,
    /// How long SIGTERM gets before SIGKILL at teardown.
    pub teardown_grace: Duration,
}

impl Default for ConsulDevLauncher {
    fn default() -> Self {
        Self {
            consul_bin: PathBuf::from("consul"),
            tls_skip_verify: false,
            teardown_grace: Duration::from_secs(5),
        }
    }
}

impl AgentLauncher for ConsulDevLauncher {
    fn launch(&self) -> Result<Box<dyn EphemeralAgent>> {
        Ok(Box::new(ConsulDevAgent::start(self)?))
    }
}

struct AgentPorts {
    http: u16,
    serf_lan: u16,
    serf_wan: u16,
    server: u16,
}

fn free_ports() -> Result<AgentPorts> {
    // Hold every listener until all ports are picked so none repeats.
    let mut held = Vec::with_capacity(4);
    for _ in 0..4 {
        let l = TcpListener::bind((LOOPBACK, 0))
            .map_err(|e| Error::msg(format!("failed to reserve a loopback port: {e}")))?;
        held.push(l);
    }
    let mut ports = Vec::with_capacity(held.len());
    for l in &held {
        ports.push(l.local_addr()?.port());
    }
    Ok(AgentPorts {
        http: ports[0],
        serf_lan: ports[1],
        serf_wan: ports[2],
        server: ports[3],
    })
}

/// Running dev agent; stopped and its data dir removed on drop.
pub struct ConsulDevAgent {
    child: Option<Child>,
    pgid: u32,
    drains: Vec<JoinHandle<()>>,
    data_dir: Option<TempDir>,
    address: String,
    client: ConsulClient,
    teardown_grace: Duration,
}

impl ConsulDevAgent {
    pub fn start(launcher: &ConsulDevLauncher) -> Result<Self> {
        let data_dir = tempfile::Builder::new()
            .prefix("consul-snapshot-verify-")
            .tempdir()
            .map_err(|e| Error::msg(format!("failed to create agent data dir: {e}")))?;
        let ports = free_ports()?;
        let address = format!("http://{LOOPBACK}:{}", ports.http);

        let mut cfg = ConsulConfig::new(
            Url::parse(&address)
                .map_err(|e| Error::msg(format!("invalid agent address {address}: {e}")))?,
        );
        cfg.tls_skip_verify = launcher.tls_skip_verify;
        cfg.timeout = Some(Duration::from_secs(120));
        let client = ConsulClient::new(&cfg)?;

        let mut cmd = Command::new(&launcher.consul_bin);
        cmd.arg("agent")
            .arg("-dev")
            .arg(format!("-node=consul-snapshot-verify-{}", std::process::id()))
            .arg(format!("-bind={LOOPBACK}"))
            .arg(format!("-client={LOOPBACK}"))
            .arg(format!("-advertise={LOOPBACK}"))
            .arg(format!("-data-dir={}", data_dir.path().display()))
            .arg(format!("-http-port={}", ports.http))
            .arg(format!("-serf-lan-port={}", ports.serf_lan))
            .arg(format!("-serf-wan-port={}", ports.serf_wan))
            .arg(format!("-server-port={}", ports.server))
            .arg("-dns-port=-1")
            .arg("-grpc-port=-1")
            .arg("-log-level=warn");
        debug!(command = ?cmd, "starting ephemeral consul agent");

        let (child, drains) = spawn_grouped(cmd, "consul-agent")?;
        let pgid = child.id();
        info!(pid = pgid, address = %address, "ephemeral consul agent started");

        Ok(Self {
            child: Some(child),
            pgid,
            drains,
            data_dir: Some(data_dir),
            address,
            client,
            teardown_grace: launcher.teardown_grace,
        })
    }

    fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if matches!(child.try_wait(), Ok(None)) {
            kill_pgroup(self.pgid, false);
            let deadline = Instant::now() + self.teardown_grace;
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if Instant::now() < deadline => {
                        std::thread::sleep(Duration::from_millis(50));
                    }
                    _ => {
                        warn!(pid = self.pgid, "ephemeral agent ignored SIGTERM, killing");
                        kill_pgroup(self.pgid, true);
                        let _ = child.kill();
                        break;
                    }
                }
            }
        }
        // Reap; harmless when already collected by try_wait.
        let _ = child.wait();
        for h in self.drains.drain(..) {
            let _ = h.join();
        }
    }
}

impl EphemeralAgent for ConsulDevAgent {
    fn address(&self) -> &str {
        &self.address
    }

    fn client(&self) -> &dyn StoreClient {
        &self.client
    }

    fn has_exited(&mut self) -> bool {
        match self.child.as_mut() {
            Some(c) => !matches!(c.try_wait(), Ok(None)),
            None => true,
        }
    }
}

impl Drop for ConsulDevAgent {
    fn drop(&mut self) {
        self.stop();
        if let Some(dir) = self.data_dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!("failed to remove agent data dir {}: {e}", path.display());
            }
        }
        info!(address = %self.address, "ephemeral consul agent torn down");
    }
}
