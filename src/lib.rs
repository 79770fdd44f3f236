//! Collection-and-dispatch core: a durable work queue, per-group fan-out, and
//! load-aware remote node selection for a distributed analysis platform.

pub mod client;
pub mod collector;
pub mod config;
pub mod error;
pub mod group;
pub mod producer;
pub mod registry;
pub mod store;
pub mod submission;

pub use client::{HttpRemoteNodeClient, RemoteNodeClient};
pub use collector::{Collector, GlobalConfig};
pub use config::Config;
pub use group::{DispatchOutcome, GroupConfig, RemoteNodeGroup};
pub use producer::{DirectoryProducer, ProducerSource};
pub use registry::{NodeRegistry, RemoteNode, SqlNodeRegistry};
pub use store::{SqlWorkloadStore, WorkloadStore};
pub use submission::{Submission, SubmissionOutcome};
