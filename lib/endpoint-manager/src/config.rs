//! Endpoint manager configuration

use std::time::Duration;
use tracing::warn;

/// Runtime settings of the endpoint manager
#[derive(Clone, Debug, PartialEq)]
pub struct ManagerConfig {
    /// Interval between endpoint GC runs. Zero disables GC.
    pub gc_interval: Duration,
    /// Concurrency cap of per-endpoint tasks in bulk operations. Zero means unbounded.
    pub max_inflight: usize,
    /// Initial backoff of a controller after a failed run
    pub error_retry_base: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            gc_interval: Duration::from_secs(300),
            max_inflight: 0,
            error_retry_base: Duration::from_secs(1),
        }
    }
}

impl ManagerConfig {
    /// Load overrides from `ENDPOINT_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load overrides through `lookup`, falling back to defaults for unset or
    /// malformed values
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = parse_var(&lookup, "ENDPOINT_GC_INTERVAL_SECS") {
            config.gc_interval = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var(&lookup, "ENDPOINT_MAX_INFLIGHT") {
            config.max_inflight = n as usize;
        }
        if let Some(ms) = parse_var(&lookup, "ENDPOINT_CONTROLLER_ERROR_RETRY_MS") {
            config.error_retry_base = Duration::from_millis(ms);
        }

        config
    }
}

fn parse_var<F>(lookup: &F, name: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(name)?;
    match value.trim().parse::<u64>() {
        Ok(n) => Some(n),
        Err(e) => {
            warn!("Ignoring invalid {}={:?}: {}", name, value, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();
        assert_eq!(config.gc_interval, Duration::from_secs(300));
        assert_eq!(config.max_inflight, 0);
        assert_eq!(config.error_retry_base, Duration::from_secs(1));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("ENDPOINT_GC_INTERVAL_SECS", "30"),
            ("ENDPOINT_MAX_INFLIGHT", " 16 "),
            ("ENDPOINT_CONTROLLER_ERROR_RETRY_MS", "250"),
        ]
        .into_iter()
        .collect();
        let config = ManagerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.gc_interval, Duration::from_secs(30));
        assert_eq!(config.max_inflight, 16);
        assert_eq!(config.error_retry_base, Duration::from_millis(250));
    }

    #[test]
    fn test_from_lookup_ignores_invalid() {
        let config = ManagerConfig::from_lookup(|k| {
            (k == "ENDPOINT_GC_INTERVAL_SECS").then(|| "soon".to_string())
        });
        assert_eq!(config, ManagerConfig::default());
    }
}
