//! Unit of work and transaction synchronization.
//!
//! A [`UnitOfWork`] bounds one logical operation. It collects the entity
//! mutations staged by commands, keeps the listeners registered for each
//! transaction outcome, and on [`UnitOfWork::close`] flushes the mutations and
//! fires exactly one outcome.
//!
//! The context is passed explicitly (`&mut UnitOfWork`) to everything that runs
//! inside it. Nested operations receive the enclosing context instead of opening
//! their own, so a job execution, the delegate it invokes and the event it
//! delivers all share one atomic outcome.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::delegate::DeploymentHandle;
use crate::error::{ConductorError, Result};
use crate::jobs::AcquisitionContext;
use crate::persistence::{EngineStore, Mutation};
use crate::telemetry::EngineMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Transaction Listeners
// ═══════════════════════════════════════════════════════════════════════════════

/// How a unit of work ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionOutcome {
    Committed,
    RolledBack,
}

impl TransactionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for TransactionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback fired once when a unit of work reaches the outcome it was registered for.
#[async_trait]
pub trait TransactionListener: Send + Sync {
    /// Name used in logs and failure reports.
    fn name(&self) -> &str {
        "anonymous"
    }

    async fn on_outcome(&self, outcome: TransactionOutcome) -> Result<()>;
}

struct FnListener<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F> TransactionListener for FnListener<F>
where
    F: Fn() -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_outcome(&self, _outcome: TransactionOutcome) -> Result<()> {
        (self.f)()
    }
}

struct RegisteredListener {
    outcome: TransactionOutcome,
    listener: Box<dyn TransactionListener>,
}

/// Marks a point inside a unit of work that can be rolled back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Savepoint {
    mutations: usize,
    listeners: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Unit of Work
// ═══════════════════════════════════════════════════════════════════════════════

/// One logical operation against the engine store.
pub struct UnitOfWork {
    id: Uuid,
    store: Arc<dyn EngineStore>,
    mutations: Vec<Mutation>,
    listeners: Vec<RegisteredListener>,
    acquisition: Option<Weak<AcquisitionContext>>,
    deployments: Vec<Arc<DeploymentHandle>>,
    opened_at: Instant,
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("mutations", &self.mutations.len())
            .field("listeners", &self.listeners.len())
            .field("deployments", &self.deployments.len())
            .finish()
    }
}

impl UnitOfWork {
    /// Open a new unit of work on `store`.
    pub fn open(store: Arc<dyn EngineStore>) -> Self {
        let id = Uuid::new_v4();
        debug!(unit_of_work = %id, "Unit of work opened");
        Self {
            id,
            store,
            mutations: Vec::new(),
            listeners: Vec::new(),
            acquisition: None,
            deployments: Vec::new(),
            opened_at: Instant::now(),
        }
    }

    /// Attach the acquisition this unit of work executes for.
    pub fn with_acquisition(mut self, acquisition: &Arc<AcquisitionContext>) -> Self {
        self.acquisition = Some(Arc::downgrade(acquisition));
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn store(&self) -> &Arc<dyn EngineStore> {
        &self.store
    }

    /// The acquisition that opened this unit of work, if it is still running.
    pub fn acquisition(&self) -> Option<Arc<AcquisitionContext>> {
        self.acquisition.as_ref().and_then(Weak::upgrade)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mutations
    // ─────────────────────────────────────────────────────────────────────────

    /// Stage a mutation to be flushed on commit.
    pub fn stage(&mut self, mutation: Mutation) {
        self.mutations.push(mutation);
    }

    /// Mutations staged so far, in staging order.
    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Listeners
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a listener for `outcome`. Listeners fire in registration order.
    pub fn register_listener(
        &mut self,
        outcome: TransactionOutcome,
        listener: impl TransactionListener + 'static,
    ) {
        self.listeners.push(RegisteredListener {
            outcome,
            listener: Box::new(listener),
        });
    }

    /// Register a closure fired after a successful commit.
    pub fn on_commit<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.register_listener(
            TransactionOutcome::Committed,
            FnListener {
                name: name.into(),
                f,
            },
        );
    }

    /// Register a closure fired when the unit of work rolls back.
    pub fn on_rollback<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.register_listener(
            TransactionOutcome::RolledBack,
            FnListener {
                name: name.into(),
                f,
            },
        );
    }

    pub fn listener_count(&self, outcome: TransactionOutcome) -> usize {
        self.listeners.iter().filter(|l| l.outcome == outcome).count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Savepoints
    // ─────────────────────────────────────────────────────────────────────────

    pub fn savepoint(&self) -> Savepoint {
        Savepoint {
            mutations: self.mutations.len(),
            listeners: self.listeners.len(),
        }
    }

    /// Discard everything staged after `savepoint`.
    ///
    /// Rollback listeners registered after the savepoint fire now; commit
    /// listeners registered after it are dropped.
    pub async fn rollback_to(&mut self, savepoint: Savepoint) {
        let discarded_mutations = self.mutations.len().saturating_sub(savepoint.mutations);
        self.mutations.truncate(savepoint.mutations);

        let from = savepoint.listeners.min(self.listeners.len());
        let discarded: Vec<_> = self.listeners.drain(from..).collect();

        debug!(
            unit_of_work = %self.id,
            discarded_mutations,
            discarded_listeners = discarded.len(),
            "Rolled back to savepoint"
        );

        // failures are logged and counted inside fire
        let _ = fire(self.id, discarded, TransactionOutcome::RolledBack).await;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Deployment Contexts
    // ─────────────────────────────────────────────────────────────────────────

    /// The deployment whose context user code currently runs in.
    pub fn current_deployment(&self) -> Option<&Arc<DeploymentHandle>> {
        self.deployments.last()
    }

    pub fn deployment_depth(&self) -> usize {
        self.deployments.len()
    }

    pub(crate) fn push_deployment(&mut self, deployment: Arc<DeploymentHandle>) {
        self.deployments.push(deployment);
    }

    pub(crate) fn pop_deployment(&mut self) -> Option<Arc<DeploymentHandle>> {
        self.deployments.pop()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Close
    // ─────────────────────────────────────────────────────────────────────────

    /// End the unit of work.
    ///
    /// `Committed` flushes the staged mutations, then fires the commit listeners.
    /// If the flush or a commit listener fails, the rollback listeners fire and
    /// the original error is returned. `RolledBack` discards the mutations and
    /// fires the rollback listeners; their failures are logged only.
    pub async fn close(self, outcome: TransactionOutcome) -> Result<()> {
        let UnitOfWork {
            id,
            store,
            mutations,
            listeners,
            opened_at,
            ..
        } = self;

        let (committed, rolled_back): (Vec<_>, Vec<_>) = listeners
            .into_iter()
            .partition(|l| l.outcome == TransactionOutcome::Committed);

        let result = match outcome {
            TransactionOutcome::Committed => {
                let staged = mutations.len();
                if !mutations.is_empty() {
                    if let Err(err) = store.flush(mutations).await {
                        warn!(
                            unit_of_work = %id,
                            error = %err,
                            "Flush failed, rolling back unit of work"
                        );
                        let _ = fire(id, rolled_back, TransactionOutcome::RolledBack).await;
                        EngineMetrics::record_unit_of_work(TransactionOutcome::RolledBack.as_str());
                        return Err(err);
                    }
                }

                match fire(id, committed, TransactionOutcome::Committed).await {
                    None => {
                        debug!(
                            unit_of_work = %id,
                            mutations = staged,
                            elapsed_ms = opened_at.elapsed().as_millis() as u64,
                            "Unit of work committed"
                        );
                        Ok(())
                    }
                    Some(err) => {
                        let _ = fire(id, rolled_back, TransactionOutcome::RolledBack).await;
                        EngineMetrics::record_unit_of_work(TransactionOutcome::RolledBack.as_str());
                        return Err(err);
                    }
                }
            }
            TransactionOutcome::RolledBack => {
                debug!(
                    unit_of_work = %id,
                    discarded_mutations = mutations.len(),
                    "Unit of work rolled back"
                );
                let _ = fire(id, rolled_back, TransactionOutcome::RolledBack).await;
                Ok(())
            }
        };

        EngineMetrics::record_unit_of_work(outcome.as_str());
        result
    }
}

/// Fire the listeners registered for `outcome`, in order, attempting every one.
/// Returns the first failure.
async fn fire(
    unit_of_work: Uuid,
    listeners: Vec<RegisteredListener>,
    outcome: TransactionOutcome,
) -> Option<ConductorError> {
    let mut first_error = None;

    for registered in listeners.into_iter().filter(|l| l.outcome == outcome) {
        let name = registered.listener.name().to_string();
        if let Err(err) = registered.listener.on_outcome(outcome).await {
            warn!(
                unit_of_work = %unit_of_work,
                listener = %name,
                outcome = %outcome,
                error = %err,
                "Transaction listener failed"
            );
            EngineMetrics::record_listener_failure(outcome.as_str());
            if first_error.is_none() {
                first_error = Some(ConductorError::listener_failed(name, err.to_string()).with_source(err));
            }
        }
    }

    first_error
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
