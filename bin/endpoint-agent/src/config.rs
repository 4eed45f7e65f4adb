//! Agent settings loaded from the environment

use endpoint_manager::ManagerConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::warn;

const DEFAULT_LISTEN: ([u8; 4], u16) = ([0, 0, 0, 0], 9876);
const DEFAULT_RUNTIME_STATE_DIR: &str = "/run/containerd/io.containerd.runtime.v2.task/k8s.io";

#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Address of the endpoint API
    pub listen: SocketAddr,
    /// Directory holding one entry per running container, named by container ID
    pub runtime_state_dir: PathBuf,
    pub manager: ManagerConfig,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen = match lookup("ENDPOINT_AGENT_LISTEN") {
            Some(addr) => addr.parse().unwrap_or_else(|e| {
                warn!("Ignoring invalid ENDPOINT_AGENT_LISTEN={:?}: {}", addr, e);
                DEFAULT_LISTEN.into()
            }),
            None => DEFAULT_LISTEN.into(),
        };

        let runtime_state_dir = lookup("ENDPOINT_RUNTIME_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RUNTIME_STATE_DIR));

        Self {
            listen,
            runtime_state_dir,
            manager: ManagerConfig::from_lookup(lookup),
        }
    }
}
