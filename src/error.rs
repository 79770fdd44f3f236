use std::time::Duration;

/// Errors surfaced by the workload store. `Transient` is retried internally by
/// [`crate::store::with_retry`] before ever reaching a caller; seeing one here
/// means retries were exhausted.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("transient store error after retries: {0}")]
    Transient(#[source] sqlx::Error),

    #[error("store error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to decode workload blob: {0}")]
    Deserialize(#[source] bincode::Error),

    #[error("failed to encode submission: {0}")]
    Serialize(#[source] bincode::Error),
}

impl StoreError {
    /// Whether this looks like a transient condition (pool exhaustion, sqlite
    /// busy/locked) worth retrying rather than surfacing immediately.
    pub fn is_transient(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
            sqlx::Error::Database(db_err) => {
                // SQLITE_BUSY = 5, SQLITE_LOCKED = 6.
                matches!(db_err.code().as_deref(), Some("5") | Some("6"))
            }
            _ => false,
        }
    }
}

/// Errors surfaced by the node registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown node-registry database {0:?}")]
    UnknownDatabase(String),

    #[error("registry query failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors surfaced by one remote submission attempt. Never retried by the
/// client itself; the group decides what to do with it (policy step).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to open attachment {path}: {source}")]
    OpenFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error submitting to {location}: {source}")]
    Transport {
        location: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("remote node rejected submission ({status}): {body}")]
    Rejected { status: u16, body: String },
}

/// Fatal errors caught at `Collector::start()`, before any worker spawns.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no groups configured; add_group must be called at least once before start()")]
    NoGroups,

    #[error("group {name:?} has invalid coverage {coverage}; must be in (0, 100]")]
    InvalidCoverage { name: String, coverage: u8 },

    #[error("node_status_update_frequency must be greater than zero")]
    InvalidHeartbeat,

    #[error("{name} must not be empty")]
    EmptyField { name: String },
}

/// Errors from `Collector::add_group`: either a configuration mistake or a
/// store error while upserting the `work_distribution_groups` row.
#[derive(Debug, thiserror::Error)]
pub enum AddGroupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors bubbling out of one dispatch iteration. Caught by the group's outer
/// supervisor loop: never fatal to the worker, always logged and slept
/// through.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// How long the outer supervisor sleeps after catching a [`GroupError`].
pub const SUPERVISOR_RETRY_DELAY: Duration = Duration::from_secs(1);
