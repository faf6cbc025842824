//! # Command Event Loop
//!
//! The single consumer of the outbound queue and the owner of the worker
//! pool. One task processes commands from the internal channel, drains
//! queued queries into at most `query_thread_count` concurrent workers, and
//! runs the 1-second timer that fires alert pushes and batch flushes while
//! the link is online.
//!
//! Scheduling rules:
//! - queries dispatch to a worker only while a slot is free; everything else
//!   stays queued, so active workers never exceed the pool size;
//! - the batch queue converts to a single worker job when it fills or when
//!   the timer finds it non-empty with no batch job running;
//! - alert pushes run in one worker at a time, guarded by a running flag;
//! - node-state updates retry on their own timer until the enqueue sticks;
//! - shutdown locks the queue, cancels in-flight queries and gives running
//!   workers a bounded drain window before the loop exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::query;
use crate::proto::node::UpdateNodeInstanceConnection;
use crate::queue::EnqueueError;
use crate::tx;
use crate::{Collaborators, LinkShared, NodeInstanceInfo};

/// Grace given to running workers at shutdown.
pub const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Retry cadence for node-state updates that could not be enqueued yet.
const NODE_STATE_RETRY: Duration = Duration::from_secs(5);

/// Opcodes processed by the command loop.
#[derive(Debug)]
pub enum LinkCommand {
    /// A host changed state; keep retrying the cloud update until it is
    /// accepted.
    NodeState(NodeInstanceInfo),
    /// A host went away; tell the cloud it is neither live nor queryable.
    NodeUnregister { node_id: String },
    /// Push one alert configuration by hash.
    PushAlertConfig { config_hash: String },
    /// Run the alert push pass across all hosts.
    PushAlert,
    /// Tear the current MQTT session down so it reconnects with fresh
    /// settings.
    ConfigMqttClient,
    /// Convert the accumulated batch into a worker job now.
    QueryBatchExecute,
    /// Begin cooperative shutdown.
    Shutdown,
}

pub struct CommandLoop {
    shared: Arc<LinkShared>,
    collaborators: Collaborators,
    commands: mpsc::Receiver<LinkCommand>,
}

impl CommandLoop {
    pub fn new(
        shared: Arc<LinkShared>,
        collaborators: Collaborators,
        commands: mpsc::Receiver<LinkCommand>,
    ) -> Self {
        Self {
            shared,
            collaborators,
            commands,
        }
    }

    pub async fn run(mut self) {
        let max_workers = self.shared.config.query_threads();
        info!("Command loop starting with {max_workers} query workers");

        let mut query_workers: JoinSet<()> = JoinSet::new();
        let mut batch_job: JoinSet<()> = JoinSet::new();
        let mut alert_job: JoinSet<()> = JoinSet::new();
        let mut aux_jobs: JoinSet<()> = JoinSet::new();

        let mut timer = tokio::time::interval(Duration::from_secs(1));
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // fill free worker slots from the queue before suspending
            while query_workers.len() < max_workers {
                let Some(next) = self.shared.queue.dequeue() else {
                    break;
                };
                let shared = self.shared.clone();
                let web_api = self.collaborators.web_api.clone();
                query_workers.spawn(async move {
                    query::execute_query(shared, web_api, next).await;
                });
            }

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        None | Some(LinkCommand::Shutdown) => break,
                        Some(command) => self.handle_command(
                            command,
                            &mut batch_job,
                            &mut alert_job,
                            &mut aux_jobs,
                        ),
                    }
                }
                _ = timer.tick() => {
                    self.on_timer(&mut batch_job, &mut alert_job);
                }
                Some(result) = query_workers.join_next(), if !query_workers.is_empty() => {
                    if let Err(e) = result {
                        warn!("Query worker task failed: {e}");
                    }
                }
                Some(_) = batch_job.join_next(), if !batch_job.is_empty() => {}
                Some(_) = alert_job.join_next(), if !alert_job.is_empty() => {}
                Some(_) = aux_jobs.join_next(), if !aux_jobs.is_empty() => {}
                _ = self.shared.queue.wait_for_work(),
                    if query_workers.len() < max_workers => {}
                _ = self.shared.shutdown.cancelled() => break,
            }
        }

        self.drain(query_workers, batch_job, alert_job, aux_jobs).await;
    }

    fn handle_command(
        &self,
        command: LinkCommand,
        batch_job: &mut JoinSet<()>,
        alert_job: &mut JoinSet<()>,
        aux_jobs: &mut JoinSet<()>,
    ) {
        match command {
            LinkCommand::NodeState(node) => self.spawn_node_state_retry(node, aux_jobs),
            LinkCommand::NodeUnregister { node_id } => {
                let Some(claim_id) = self.shared.claim_id() else {
                    return;
                };
                let update = UpdateNodeInstanceConnection {
                    claim_id,
                    node_id,
                    live: false,
                    queryable: false,
                    session_id: self.shared.session_id(),
                    hops: 0,
                    capabilities: self.shared.capabilities().to_vec(),
                };
                if let Err(e) = self.shared.queue.enqueue(tx::node_state_update(update)) {
                    warn!("Dropping node unregister update: {e}");
                }
            }
            LinkCommand::PushAlertConfig { config_hash } => {
                let shared = self.shared.clone();
                let alerts = self.collaborators.alerts.clone();
                aux_jobs.spawn(async move {
                    let fetched = tokio::task::spawn_blocking(move || {
                        alerts.alarm_configuration(&config_hash)
                    })
                    .await
                    .ok()
                    .flatten();
                    if let Some(config) = fetched {
                        if let Err(e) = shared.queue.enqueue(tx::provide_alarm_config(config)) {
                            warn!("Dropping alert configuration push: {e}");
                        }
                    }
                });
            }
            LinkCommand::PushAlert => self.spawn_alert_push(alert_job),
            LinkCommand::ConfigMqttClient => {
                info!("Transport reconfiguration requested, recycling the session");
                self.shared.request_reconnect();
            }
            LinkCommand::QueryBatchExecute => self.spawn_batch(batch_job),
            LinkCommand::Shutdown => unreachable!("handled by the main loop"),
        }
    }

    /// Timer tick: while online, fire the periodic alert push and flush a
    /// pending batch.
    fn on_timer(&self, batch_job: &mut JoinSet<()>, alert_job: &mut JoinSet<()>) {
        if !self.shared.is_online() {
            return;
        }
        self.spawn_alert_push(alert_job);
        if !self.shared.batch.is_empty() {
            self.spawn_batch(batch_job);
        }
    }

    /// At most one alert push runs at a time.
    fn spawn_alert_push(&self, alert_job: &mut JoinSet<()>) {
        if !alert_job.is_empty() {
            return;
        }
        let alerts = self.collaborators.alerts.clone();
        alert_job.spawn(async move {
            let _ = tokio::task::spawn_blocking(move || {
                alerts.push_alerts();
                alerts.check_node_metadata();
            })
            .await;
        });
    }

    /// At most one batch job runs at a time; items keep accumulating while
    /// one is in flight.
    fn spawn_batch(&self, batch_job: &mut JoinSet<()>) {
        if !batch_job.is_empty() {
            return;
        }
        let items = self.shared.batch.drain();
        if items.is_empty() {
            return;
        }
        let shared = self.shared.clone();
        batch_job.spawn(query::execute_batch(shared, items));
    }

    /// Retries the state update until the enqueue sticks, then stops.
    fn spawn_node_state_retry(&self, node: NodeInstanceInfo, aux_jobs: &mut JoinSet<()>) {
        let Some(node_id) = node.node_id.clone() else {
            // not registered with the cloud yet; SendNodeInstances covers it
            debug!("Skipping state update for unregistered {}", node.machine_guid);
            return;
        };
        let shared = self.shared.clone();
        aux_jobs.spawn(async move {
            loop {
                if shared.shutdown.is_cancelled() {
                    return;
                }
                if let Some(claim_id) = shared.claim_id() {
                    let update = UpdateNodeInstanceConnection {
                        claim_id,
                        node_id: node_id.clone(),
                        live: node.live,
                        queryable: node.queryable,
                        session_id: shared.session_id(),
                        hops: node.hops,
                        capabilities: shared.capabilities().to_vec(),
                    };
                    match shared.queue.enqueue(tx::node_state_update(update)) {
                        Ok(()) => return,
                        Err(EnqueueError::Blocked) => return,
                        Err(EnqueueError::Full) => {}
                    }
                }
                tokio::time::sleep(NODE_STATE_RETRY).await;
            }
        });
    }

    /// Cooperative shutdown: no new work, cancel in-flight queries, give
    /// running workers the drain window, then drop everything left.
    async fn drain(
        &self,
        mut query_workers: JoinSet<()>,
        mut batch_job: JoinSet<()>,
        mut alert_job: JoinSet<()>,
        mut aux_jobs: JoinSet<()>,
    ) {
        info!("Command loop shutting down");
        self.shared.shutdown.cancel();
        self.shared.queue.lock();
        self.shared.inflight.cancel_all();

        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN;
        while !query_workers.is_empty() {
            match tokio::time::timeout_at(deadline, query_workers.join_next()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "{} workers still busy after {SHUTDOWN_DRAIN:?}, aborting",
                        query_workers.len()
                    );
                    query_workers.abort_all();
                    break;
                }
            }
        }
        batch_job.abort_all();
        alert_job.abort_all();
        aux_jobs.abort_all();

        self.shared.queue.flush();
        info!("Command loop stopped");
    }
}
