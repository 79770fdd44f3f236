use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::client::RemoteNodeClient;
use crate::error::{AddGroupError, ConfigError};
use crate::group::{GroupConfig, RemoteNodeGroup};
use crate::producer::ProducerSource;
use crate::registry::NodeRegistry;
use crate::store::WorkloadStore;

/// Process-wide settings injected into the [`Collector`] and every group at
/// construction, never read from ambient globals.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub heartbeat: Duration,
    pub ca_chain_path: Option<std::path::PathBuf>,
    pub company_id: String,
}

/// Orchestrator: hosts the producer loop and owns group lifecycle.
pub struct Collector<S, R, C> {
    store: Arc<S>,
    registry: Arc<R>,
    client: Arc<C>,
    global: GlobalConfig,
    producer: Box<dyn ProducerSource>,
    groups: Vec<GroupConfig>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl<S, R, C> Collector<S, R, C>
where
    S: WorkloadStore + 'static,
    R: NodeRegistry + 'static,
    C: RemoteNodeClient + 'static,
{
    pub fn new(
        store: Arc<S>,
        registry: Arc<R>,
        client: Arc<C>,
        global: GlobalConfig,
        producer: Box<dyn ProducerSource>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            registry,
            client,
            global,
            producer,
            groups: Vec::new(),
            shutdown_tx,
            shutdown_rx,
            handles: Vec::new(),
        }
    }

    /// Upserts the groups table by `name`, returning existing `group_id` or a
    /// fresh one, and registers a [`GroupConfig`] bound to it. Must be called
    /// before [`Collector::start`].
    pub async fn add_group(
        &mut self,
        name: impl Into<String>,
        coverage: u8,
        full_delivery: bool,
        database: impl Into<String>,
    ) -> Result<i64, AddGroupError> {
        let name = name.into();
        let database = database.into();

        if coverage == 0 || coverage > 100 {
            return Err(ConfigError::InvalidCoverage { name, coverage }.into());
        }
        if database.trim().is_empty() {
            return Err(ConfigError::EmptyField {
                name: format!("group {name:?} database"),
            }
            .into());
        }

        let group_id = self.store.upsert_group(&name).await?;

        self.groups.push(GroupConfig {
            name,
            coverage,
            full_delivery,
            database,
            group_id,
            batch_size: 32,
        });

        Ok(group_id)
    }

    fn group_ids(&self) -> Vec<i64> {
        self.groups.iter().map(|g| g.group_id).collect()
    }

    /// Requires at least one group; spawns the producer worker and starts
    /// every group worker.
    pub fn start(&mut self) -> Result<(), ConfigError> {
        if self.groups.is_empty() {
            return Err(ConfigError::NoGroups);
        }
        if self.global.heartbeat.is_zero() {
            return Err(ConfigError::InvalidHeartbeat);
        }

        let group_ids = self.group_ids();
        let store = self.store.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let producer = self.producer.clone_box();

        let producer_handle = tokio::spawn(async move {
            run_producer_loop(producer, store, group_ids, &mut shutdown_rx).await;
        });
        self.handles.push(producer_handle);

        for config in self.groups.drain(..).collect::<Vec<_>>() {
            let group = RemoteNodeGroup::new(
                config,
                self.store.clone(),
                self.registry.clone(),
                self.client.clone(),
                self.global.heartbeat,
                self.global.company_id.clone(),
                self.shutdown_rx.clone(),
            );
            let name = group.name().to_string();
            let handle = tokio::spawn(async move {
                group.run().await;
            });
            tracing::info!(group = %name, "group worker started");
            self.handles.push(handle);
        }

        Ok(())
    }

    /// Signals shutdown to every worker; does not wait for them to finish.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Joins the producer first, then each group. Total drain time is bounded
    /// by the longest in-flight submission plus batch cleanup.
    pub async fn wait(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "worker task panicked");
            }
        }
    }
}

async fn run_producer_loop<S>(
    mut producer: Box<dyn ProducerSource>,
    store: Arc<S>,
    group_ids: Vec<i64>,
    shutdown_rx: &mut watch::Receiver<bool>,
) where
    S: WorkloadStore,
{
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match producer.get_next_submission().await {
            Ok(Some(submission)) => match store.enqueue(&submission, &group_ids).await {
                Ok(work_id) => {
                    tracing::info!(work_id, mode = %submission.analysis_mode, "submission enqueued");
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to enqueue submission");
                }
            },
            Ok(None) => {
                let sleep = tokio::time::sleep(Duration::from_secs(1));
                tokio::select! {
                    _ = sleep => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "producer failed to get next submission");
                let sleep = tokio::time::sleep(Duration::from_secs(1));
                tokio::select! {
                    _ = sleep => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
        }
    }

    tracing::info!("producer worker stopped");
}

