//! # Sync Agent
//!
//! Main orchestrator for the sync engine. Seeds partition bindings, spawns
//! the dispatch workers and the retention worker, and stops them together.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncAgent Architecture                           │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                         SyncAgent                                │  │
//! │  │                                                                  │  │
//! │  │  • Seeds partition bindings from config                          │  │
//! │  │  • Spawns N dispatch workers per partition                       │  │
//! │  │  • Spawns one retention worker                                   │  │
//! │  │  • trigger_now / status / shutdown                               │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ DispatchWorker │  │ DispatchWorker │  │   RetentionWorker      │    │
//! │  │  lisbon-cloud  │  │  porto-cloud   │  │                        │    │
//! │  │  (x workers)   │  │  (x workers)   │  │ reap, embedded, purge  │    │
//! │  └───────┬────────┘  └───────┬────────┘  └────────────────────────┘    │
//! │          └──────────┬────────┘                                          │
//! │                     ▼                                                   │
//! │        SyncTransport + RemoteDirectory (WsTransport by default)        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use harbor_db::Database;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::gateway::{BindingResolver, SyncGateway};
use crate::operator::{Operator, QueueSummary};
use crate::reconciler::RemoteReconciler;
use crate::retention::{LocalRecordProbe, RetentionWorker};
use crate::transport::{RemoteDirectory, SyncTransport, TransportConfig, WsTransport};
use crate::worker::{DispatchWorker, SyncBookkeeping};

/// How long shutdown waits for a worker to finish its current cycle.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

// =============================================================================
// Sync Status
// =============================================================================

/// Current sync status for external queries.
#[derive(Debug, Clone)]
pub struct SyncStatus {
    /// Whether the workers are running.
    pub running: bool,

    /// Number of dispatch workers spawned.
    pub workers: usize,

    /// When the agent was started.
    pub started_at: Option<DateTime<Utc>>,

    /// Queue counts per partition.
    pub queue: QueueSummary,
}

// =============================================================================
// Sync Agent
// =============================================================================

pub struct SyncAgent {
    config: Arc<SyncConfig>,
    db: Database,
    transport: Arc<dyn SyncTransport>,
    directory: Arc<dyn RemoteDirectory>,
    bookkeeping: Option<Arc<dyn SyncBookkeeping>>,
    probe: Option<Arc<dyn LocalRecordProbe>>,
    resolver: Arc<BindingResolver>,
    trigger: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    workers: usize,
    started_at: Option<DateTime<Utc>>,
}

impl SyncAgent {
    pub fn builder(config: SyncConfig) -> SyncAgentBuilder {
        SyncAgentBuilder::new(config)
    }

    /// Enqueue gateway sharing this agent's binding cache.
    pub fn gateway(&self) -> SyncGateway {
        SyncGateway::new(
            self.db.queue(),
            self.resolver.clone(),
            self.config.dispatch.max_attempts,
        )
    }

    pub fn operator(&self) -> Operator {
        Operator::new(self.db.queue())
    }

    /// Reconciler for inbound records.
    pub fn reconciler(&self) -> RemoteReconciler {
        RemoteReconciler::new(self.db.identities(), self.db.queue(), self.directory.clone())
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Seeds bindings and spawns every worker.
    pub async fn start(&mut self) -> SyncResult<()> {
        if self.is_running() {
            return Err(SyncError::Internal("sync agent already started".into()));
        }

        self.resolver.seed(&self.config.partitions).await?;
        self.shutdown_tx.send_replace(false);

        info!(
            device_id = %self.config.device_id(),
            partitions = self.config.partitions.len(),
            workers_per_partition = self.config.dispatch.workers_per_partition,
            "Starting sync agent"
        );

        let reconciler = Arc::new(self.reconciler());
        for partition in &self.config.partitions {
            for _ in 0..self.config.dispatch.workers_per_partition {
                let mut worker = DispatchWorker::new(
                    partition.partition_key(),
                    partition.endpoint.clone(),
                    self.db.queue(),
                    reconciler.clone(),
                    self.transport.clone(),
                    &self.config.dispatch,
                );
                if let Some(bookkeeping) = &self.bookkeeping {
                    worker = worker.with_bookkeeping(bookkeeping.clone());
                }
                self.tasks.push(tokio::spawn(
                    worker.run(self.shutdown_tx.subscribe(), self.trigger.clone()),
                ));
                self.workers += 1;
            }
        }

        let mut retention = RetentionWorker::new(self.db.queue(), self.config.retention.clone());
        if let Some(probe) = &self.probe {
            retention = retention.with_probe(probe.clone());
        }
        self.tasks
            .push(tokio::spawn(retention.run(self.shutdown_tx.subscribe())));

        self.started_at = Some(Utc::now());
        info!(workers = self.workers, "Sync agent started");
        Ok(())
    }

    /// Wakes idle dispatch workers for an immediate cycle.
    pub fn trigger_now(&self) {
        self.trigger.notify_waiters();
    }

    pub async fn status(&self) -> SyncResult<SyncStatus> {
        Ok(SyncStatus {
            running: self.is_running(),
            workers: self.workers,
            started_at: self.started_at,
            queue: self.operator().summary().await?,
        })
    }

    /// Stops every worker after its current cycle.
    pub async fn shutdown(&mut self) -> SyncResult<()> {
        info!("Shutting down sync agent");
        self.shutdown_tx.send_replace(true);

        for task in self.tasks.drain(..) {
            match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Sync task panicked"),
                Err(_) => warn!("Sync task did not stop in time; entries it holds will be reaped"),
            }
        }
        self.workers = 0;
        self.started_at = None;

        info!("Sync agent stopped");
        Ok(())
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for creating SyncAgent with options.
pub struct SyncAgentBuilder {
    config: SyncConfig,
    db: Option<Database>,
    transport: Option<Arc<dyn SyncTransport>>,
    directory: Option<Arc<dyn RemoteDirectory>>,
    bookkeeping: Option<Arc<dyn SyncBookkeeping>>,
    probe: Option<Arc<dyn LocalRecordProbe>>,
}

impl SyncAgentBuilder {
    pub fn new(config: SyncConfig) -> Self {
        SyncAgentBuilder {
            config,
            db: None,
            transport: None,
            directory: None,
            bookkeeping: None,
            probe: None,
        }
    }

    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    /// Uses one collaborator for both submission and lookup.
    pub fn with_central<C>(mut self, central: Arc<C>) -> Self
    where
        C: SyncTransport + RemoteDirectory + 'static,
    {
        let transport: Arc<dyn SyncTransport> = central.clone();
        let directory: Arc<dyn RemoteDirectory> = central;
        self.transport = Some(transport);
        self.directory = Some(directory);
        self
    }

    pub fn with_bookkeeping(mut self, bookkeeping: Arc<dyn SyncBookkeeping>) -> Self {
        self.bookkeeping = Some(bookkeeping);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn LocalRecordProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Builds the agent. Without an explicit central, a [`WsTransport`]
    /// is built from the transport settings.
    pub fn build(self) -> SyncResult<SyncAgent> {
        self.config.validate()?;

        let db = self
            .db
            .ok_or_else(|| SyncError::InvalidConfig("Database required".into()))?;

        let (transport, directory) = match (self.transport, self.directory) {
            (Some(t), Some(d)) => (t, d),
            _ => {
                let ws = Arc::new(WsTransport::new(
                    TransportConfig::from(&self.config.transport),
                    self.config.device_id(),
                ));
                let transport: Arc<dyn SyncTransport> = ws.clone();
                let directory: Arc<dyn RemoteDirectory> = ws;
                (transport, directory)
            }
        };

        let resolver = Arc::new(BindingResolver::new(
            db.bindings(),
            self.config.cache.binding_ttl(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(SyncAgent {
            config: Arc::new(self.config),
            db,
            transport,
            directory,
            bookkeeping: self.bookkeeping,
            probe: self.probe,
            resolver,
            trigger: Arc::new(Notify::new()),
            shutdown_tx,
            tasks: Vec::new(),
            workers: 0,
            started_at: None,
        })
    }
}
