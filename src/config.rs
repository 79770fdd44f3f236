use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;

/// CLI surface for the `collectord` binary: a `clap::Parser` struct with
/// env-var fallbacks (`#[arg(..., env = "...")]`) feeding a validated config
/// type, rather than reading globals at use sites.
#[derive(Parser, Debug)]
#[command(name = "collectord", version, about = "Collection-and-dispatch core")]
pub struct Args {
    #[arg(long, env = "COLLECTOR_WORKLOAD_DB", default_value = "sqlite://workload.db")]
    pub workload_db: String,

    #[arg(long, env = "COLLECTOR_REGISTRY_DB", default_value = "sqlite://registry.db")]
    pub registry_db: String,

    #[arg(long, env = "COLLECTOR_INBOX", default_value = "inbox")]
    pub inbox: PathBuf,

    /// `engine.node_status_update_frequency`: seconds between node heartbeats.
    /// A node is considered live for twice this long.
    #[arg(long, env = "COLLECTOR_NODE_STATUS_UPDATE_FREQUENCY", default_value_t = 60)]
    pub node_status_update_frequency: u64,

    /// `SSL.ca_chain_path`: certificate bundle for outbound submissions.
    #[arg(long, env = "COLLECTOR_CA_CHAIN_PATH")]
    pub ca_chain_path: Option<PathBuf>,

    /// `COMPANY_ID`: tenant identifier for node lookups.
    #[arg(long, env = "COLLECTOR_COMPANY_ID")]
    pub company_id: String,

    #[arg(long, env = "COLLECTOR_SUBMIT_TIMEOUT_SECONDS", default_value_t = 120)]
    pub submit_timeout_seconds: u64,
}

/// Validated process-wide configuration, built once at startup and injected
/// into the [`crate::collector::Collector`] and every group at construction
/// (not read from ambient globals).
#[derive(Debug, Clone)]
pub struct Config {
    pub workload_db: String,
    pub registry_db: String,
    pub inbox: PathBuf,
    pub node_status_update_frequency: Duration,
    pub ca_chain_path: Option<PathBuf>,
    pub company_id: String,
    pub submit_timeout: Duration,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        if args.node_status_update_frequency == 0 {
            return Err(ConfigError::InvalidHeartbeat);
        }
        if args.company_id.trim().is_empty() {
            return Err(ConfigError::EmptyField {
                name: "company_id".to_string(),
            });
        }

        Ok(Self {
            workload_db: args.workload_db,
            registry_db: args.registry_db,
            inbox: args.inbox,
            node_status_update_frequency: Duration::from_secs(args.node_status_update_frequency),
            ca_chain_path: args.ca_chain_path,
            company_id: args.company_id,
            submit_timeout: Duration::from_secs(args.submit_timeout_seconds.max(1)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            workload_db: "sqlite::memory:".to_string(),
            registry_db: "sqlite::memory:".to_string(),
            inbox: PathBuf::from("inbox"),
            node_status_update_frequency: 60,
            ca_chain_path: None,
            company_id: "acme".to_string(),
            submit_timeout_seconds: 30,
        }
    }

    #[test]
    fn rejects_zero_heartbeat() {
        let mut args = base_args();
        args.node_status_update_frequency = 0;
        assert!(matches!(Config::from_args(args), Err(ConfigError::InvalidHeartbeat)));
    }

    #[test]
    fn rejects_empty_company_id() {
        let mut args = base_args();
        args.company_id = "  ".to_string();
        assert!(Config::from_args(args).is_err());
    }

    #[test]
    fn accepts_valid_args() {
        let cfg = Config::from_args(base_args()).unwrap();
        assert_eq!(cfg.node_status_update_frequency, Duration::from_secs(60));
    }
}
