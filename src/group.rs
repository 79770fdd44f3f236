use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::client::RemoteNodeClient;
use crate::error::GroupError;
use crate::registry::{NodeRegistry, RemoteNode};
use crate::store::WorkloadStore;
use crate::submission::{Submission, SubmissionOutcome};

#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub name: String,
    // Percentage of submissions actually attempted, in (0, 100].
    pub coverage: u8,
    // If true, a submission that fails to send stays READY and is retried
    // forever. If false, one failed attempt marks the row COMPLETED.
    pub full_delivery: bool,
    // Logical name of the node-registry backend to query.
    pub database: String,
    pub group_id: i64,
    pub batch_size: i64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            coverage: 100,
            full_delivery: true,
            database: String::new(),
            group_id: 0,
            batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// At least one row was successfully submitted; loop again immediately.
    WorkSubmitted,
    /// No READY rows for this group.
    NoWorkAvailable,
    /// Rows exist but no live node accepts their modes.
    NoNodesAvailable,
    /// Rows existed and were processed, but all were skipped or failed without success.
    NoWorkSubmitted,
}

pub struct RemoteNodeGroup<S, R, C> {
    config: GroupConfig,
    store: Arc<S>,
    registry: Arc<R>,
    client: Arc<C>,
    heartbeat: Duration,
    company_id: String,
    // In-memory, per-group, single-worker: no locking needed. Resets on
    // restart, which preserves the long-run average but not short-run
    // sampling (see DESIGN.md).
    coverage_counter: AtomicU32,
    shutdown: watch::Receiver<bool>,
}

impl<S, R, C> RemoteNodeGroup<S, R, C>
where
    S: WorkloadStore + 'static,
    R: NodeRegistry + 'static,
    C: RemoteNodeClient + 'static,
{
    pub fn new(
        config: GroupConfig,
        store: Arc<S>,
        registry: Arc<R>,
        client: Arc<C>,
        heartbeat: Duration,
        company_id: String,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            client,
            heartbeat,
            company_id,
            coverage_counter: AtomicU32::new(0),
            shutdown,
        }
    }

    pub fn group_id(&self) -> i64 {
        self.config.group_id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    // Outer supervisor loop: a store error here never kills the worker, it
    // logs, sleeps, and tries again next cycle.
    pub async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let outcome = match self.dispatch_iteration().await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(group = %self.config.name, error = %err, "dispatch iteration failed");
                    if self.sleep_cancellable(crate::error::SUPERVISOR_RETRY_DELAY).await {
                        break;
                    }
                    continue;
                }
            };

            let done = match outcome {
                DispatchOutcome::WorkSubmitted => {
                    if *self.shutdown.borrow() {
                        true
                    } else {
                        false
                    }
                }
                DispatchOutcome::NoWorkAvailable | DispatchOutcome::NoWorkSubmitted => {
                    self.sleep_cancellable(Duration::from_secs(1)).await
                }
                DispatchOutcome::NoNodesAvailable => {
                    self.sleep_cancellable(self.heartbeat / 2).await
                }
            };

            if done {
                break;
            }
        }

        tracing::info!(group = %self.config.name, "dispatch worker stopped");
    }

    // Races the sleep against the shutdown signal; returns true if shutdown
    // fired first.
    async fn sleep_cancellable(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.shutdown.changed() => true,
        }
    }

    pub async fn dispatch_iteration(&self) -> Result<DispatchOutcome, GroupError> {
        // Collect the distinct modes this group currently has READY work for.
        let modes = self.store.peek_modes(self.config.group_id).await?;
        if modes.is_empty() {
            return Ok(DispatchOutcome::NoWorkAvailable);
        }

        // Snapshot live candidate nodes for those modes and split them into
        // any-mode nodes (which can take any claimed row) versus nodes bound
        // to a specific mode.
        let max_age = self.heartbeat.as_secs() as i64 * 2;
        let nodes = self
            .registry
            .snapshot(&self.config.database, &modes, max_age, &self.company_id)
            .await?;

        let mut any_mode_nodes: Vec<RemoteNode> = Vec::new();
        let mut mode_to_nodes: std::collections::HashMap<String, Vec<RemoteNode>> = std::collections::HashMap::new();
        for node in nodes {
            if node.any_mode {
                any_mode_nodes.push(node);
            } else {
                mode_to_nodes.entry(node.analysis_mode.clone()).or_default().push(node);
            }
        }

        if any_mode_nodes.is_empty() && mode_to_nodes.is_empty() {
            return Ok(DispatchOutcome::NoNodesAvailable);
        }

        let modes: Vec<String> = if any_mode_nodes.is_empty() {
            let filtered: Vec<String> = modes.into_iter().filter(|m| mode_to_nodes.contains_key(m)).collect();
            if filtered.is_empty() {
                return Ok(DispatchOutcome::NoNodesAvailable);
            }
            filtered
        } else {
            modes
        };

        let batch = self
            .store
            .claim_batch(self.config.group_id, &modes, self.config.batch_size)
            .await?;

        let mut submitted_any = false;

        // claim_batch already returns rows in ascending work_id order; process
        // them in that order.
        for item in batch {
            let work_id = item.work_id;

            // Deserialize the claimed blob back into a Submission.
            let submission = match Submission::decode(&item.blob) {
                Ok(s) => s,
                Err(err) => {
                    tracing::error!(group = %self.config.name, work_id, error = %err, "undecodable workload blob; marking completed with no outcome hook");
                    self.store.mark_completed(self.config.group_id, work_id).await?;
                    continue;
                }
            };

            // Coverage gate: admit this row only often enough to hit the
            // configured percentage in the long run.
            let prev = self.coverage_counter.fetch_add(self.config.coverage as u32, Ordering::SeqCst);
            let counter = prev + self.config.coverage as u32;
            if counter < 100 {
                tracing::debug!(group = %self.config.name, work_id, "skipped by coverage sampling");
                self.store.mark_completed(self.config.group_id, work_id).await?;
                // Unlike an undecodable blob, the submission was successfully
                // decoded here, so finalization still runs: if this is the
                // last distribution row for the workload, the row is deleted
                // and on_success fires, same as any other non-failed
                // completion. Coverage sampling never discards a row without
                // also finalizing it.
                self.finalize(work_id, &submission, false).await?;
                continue;
            }
            self.coverage_counter.fetch_sub(100, Ordering::SeqCst);

            // Target selection: pick the least-loaded node that can take this mode.
            let candidates: Vec<&RemoteNode> = any_mode_nodes
                .iter()
                .chain(mode_to_nodes.get(&item.mode).into_iter().flatten())
                .collect();

            let target = match candidates.into_iter().min_by_key(|n| n.workload_count) {
                Some(node) => node.clone(),
                None => {
                    // Unreachable given the earlier snapshot already dropped any
                    // mode with no candidate nodes, but leave the row READY
                    // rather than panic if node_modes data mutates mid-iteration.
                    tracing::error!(group = %self.config.name, work_id, mode = %item.mode, "no candidate node for claimed mode; leaving row READY");
                    continue;
                }
            };

            // Attempt the submission.
            let failed = match self.client.submit(&target, &submission).await {
                Ok(_) => false,
                Err(err) => {
                    tracing::warn!(group = %self.config.name, work_id, node = %target.name, error = %err, "submission attempt failed");
                    true
                }
            };

            if !failed {
                submitted_any = true;
            }

            // Delivery policy: a failed attempt under full_delivery stays READY
            // for a future retry instead of being marked COMPLETED.
            if failed && self.config.full_delivery {
                // Row stays READY; retried on a future iteration, possibly against
                // a different target.
                continue;
            }

            self.store.mark_completed(self.config.group_id, work_id).await?;
            self.finalize(work_id, &submission, failed).await?;
        }

        Ok(if submitted_any {
            DispatchOutcome::WorkSubmitted
        } else {
            DispatchOutcome::NoWorkSubmitted
        })
    }

    // Fires the outcome hook iff this was the last distribution row
    // referencing the workload. Hook exceptions are logged and swallowed.
    async fn finalize(&self, work_id: i64, submission: &Submission, failed: bool) -> Result<(), GroupError> {
        let remaining = self.store.count_remaining(work_id).await?;
        if remaining > 0 {
            return Ok(());
        }

        self.store.delete_workload(work_id).await?;

        let outcome = std::panic::AssertUnwindSafe(|| {
            if failed {
                submission.on_failure();
            } else {
                submission.on_success();
            }
        });
        if let Err(panic) = std::panic::catch_unwind(outcome) {
            tracing::error!(work_id, failed, panic = ?panic, "outcome hook panicked; swallowed");
        }

        Ok(())
    }
}
