//! Periodic reconciliation of every stored resource.
//!
//! Each tick dispatches a pass for every resource that is not already in
//! flight and not waiting out a failure backoff, up to the concurrency
//! limit. Passes run as spawned tasks with their own deadline and observe the
//! shutdown signal through their [`PassContext`].

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use xrm_reconcile::{PassContext, PassOutcome};

use crate::backoff::BackoffTracker;
use crate::config::Config;
use crate::registry::Registry;
use crate::store::{ResourceKey, ResourceStore};

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub pass_timeout: Duration,
    pub max_concurrency: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig::from(&Config::default())
    }
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.reconcile_interval,
            pass_timeout: config.pass_timeout,
            max_concurrency: config.max_concurrency,
            backoff_base: config.backoff_base,
            backoff_max: config.backoff_max,
        }
    }
}

/// How a single pass ended, from the scheduler's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassResult {
    Synced,
    Deferred,
    Failed,
    /// Deletion finished and the resource was dropped from the store.
    Removed,
    /// The resource vanished or was busy when the pass started.
    Skipped,
}

/// Counters for one scheduling round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub dispatched: usize,
    pub synced: usize,
    pub deferred: usize,
    pub failed: usize,
    pub removed: usize,
    pub skipped: usize,
}

impl TickStats {
    fn record(&mut self, joined: Result<(ResourceKey, PassResult), JoinError>) {
        match joined {
            Ok((_, PassResult::Synced)) => self.synced += 1,
            Ok((_, PassResult::Deferred)) => self.deferred += 1,
            Ok((_, PassResult::Failed)) => self.failed += 1,
            Ok((_, PassResult::Removed)) => self.removed += 1,
            Ok((_, PassResult::Skipped)) => self.skipped += 1,
            Err(e) => {
                error!(error = %e, "Reconciliation task panicked");
                self.failed += 1;
            }
        }
    }
}

struct Shared {
    store: ResourceStore,
    registry: Registry,
    backoff: Mutex<BackoffTracker>,
    in_flight: Mutex<BTreeSet<ResourceKey>>,
    pass_timeout: Duration,
}

impl Shared {
    fn backoff(&self) -> MutexGuard<'_, BackoffTracker> {
        self.backoff.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight(&self) -> MutexGuard<'_, BTreeSet<ResourceKey>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[instrument(skip_all, fields(resource = %key))]
    async fn pass(&self, key: &ResourceKey, ctx: PassContext) -> PassResult {
        let backoff_key = key.to_string();

        let Some(engine) = self.registry.get(&key.kind) else {
            let delay = self.backoff().record_failure(&backoff_key, Instant::now());
            warn!(
                retry_in_secs = delay.as_secs(),
                "No reconciler registered for kind"
            );
            return PassResult::Failed;
        };

        let mut checkout = match self.store.check_out(key) {
            Ok(checkout) => checkout,
            Err(e) => {
                debug!(error = %e, "Skipping pass");
                return PassResult::Skipped;
            }
        };
        let Some(resource) = checkout.resource_mut() else {
            return PassResult::Skipped;
        };

        let report = engine.run_pass(&ctx, resource).await;

        let result = match &report.outcome {
            PassOutcome::Synced(action) => {
                self.backoff().clear(&backoff_key);
                debug!(?action, "Pass synced");
                PassResult::Synced
            }
            PassOutcome::Deferred { field, reason } => {
                debug!(field = %field, reason = %reason, "Pass deferred");
                PassResult::Deferred
            }
            PassOutcome::Failed(err) => {
                let delay = self.backoff().record_failure(&backoff_key, Instant::now());
                warn!(
                    phase = %err.phase(),
                    error = %err,
                    retry_in_secs = delay.as_secs(),
                    "Reconciliation pass failed"
                );
                PassResult::Failed
            }
        };

        if report.removable {
            checkout.discard();
            self.store.remove(key);
            self.backoff().clear(&backoff_key);
            info!("External resource gone, releasing resource");
            return PassResult::Removed;
        }

        checkout.check_in();
        result
    }
}

/// Marks a resource in flight until dropped.
struct InFlight {
    shared: Arc<Shared>,
    key: ResourceKey,
}

impl InFlight {
    fn claim(shared: &Arc<Shared>, key: &ResourceKey) -> Option<Self> {
        shared.in_flight().insert(key.clone()).then(|| Self {
            shared: Arc::clone(shared),
            key: key.clone(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.shared.in_flight().remove(&self.key);
    }
}

/// Drives every resource in the store toward its desired state.
pub struct Scheduler {
    shared: Arc<Shared>,
    semaphore: Arc<Semaphore>,
    interval: Duration,
    /// Where the last round stopped at the concurrency limit.
    resume_at: Mutex<Option<ResourceKey>>,
}

impl Scheduler {
    pub fn new(store: ResourceStore, registry: Registry, config: SchedulerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                registry,
                backoff: Mutex::new(BackoffTracker::new(config.backoff_base, config.backoff_max)),
                in_flight: Mutex::new(BTreeSet::new()),
                pass_timeout: config.pass_timeout,
            }),
            semaphore: Arc::new(Semaphore::new(config.max_concurrency)),
            interval: config.interval,
            resume_at: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &ResourceStore {
        &self.shared.store
    }

    /// Consecutive failures recorded for a resource.
    pub fn failures(&self, key: &ResourceKey) -> u32 {
        self.shared.backoff().failures(&key.to_string())
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight().len()
    }

    /// Run until shutdown is signaled, then wait for in-flight passes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            resources = self.shared.store.len(),
            "Starting scheduler"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut passes = JoinSet::new();
        let mut stats = TickStats::default();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    stats.dispatched += self.dispatch(&mut passes, &shutdown);
                }
                Some(joined) = passes.join_next(), if !passes.is_empty() => {
                    stats.record(joined);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler shutting down");
                        break;
                    }
                }
            }
        }

        while let Some(joined) = passes.join_next().await {
            stats.record(joined);
        }
        info!(
            dispatched = stats.dispatched,
            synced = stats.synced,
            deferred = stats.deferred,
            failed = stats.failed,
            removed = stats.removed,
            "Scheduler stopped"
        );
    }

    /// Dispatch one round and wait for all of its passes.
    pub async fn run_once(&self) -> TickStats {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut passes = JoinSet::new();
        let mut stats = TickStats {
            dispatched: self.dispatch(&mut passes, &shutdown_rx),
            ..TickStats::default()
        };
        while let Some(joined) = passes.join_next().await {
            stats.record(joined);
        }
        stats
    }

    fn dispatch(
        &self,
        passes: &mut JoinSet<(ResourceKey, PassResult)>,
        shutdown: &watch::Receiver<bool>,
    ) -> usize {
        let now = Instant::now();
        let mut keys = self.shared.store.keys();
        {
            let live: BTreeSet<String> = keys.iter().map(ToString::to_string).collect();
            self.shared.backoff().retain(|key| live.contains(key));
        }

        // Start where the previous round ran out of slots so every resource
        // gets its turn.
        let mut resume_at = self
            .resume_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(resume) = resume_at.take() {
            let start = keys.partition_point(|k| *k < resume);
            keys.rotate_left(start);
        }

        let mut dispatched = 0;
        for key in keys {
            if !self.shared.backoff().is_ready(&key.to_string(), now) {
                continue;
            }
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                debug!("Concurrency limit reached, deferring the rest to the next tick");
                *resume_at = Some(key);
                break;
            };
            let Some(claim) = InFlight::claim(&self.shared, &key) else {
                continue;
            };

            let shared = Arc::clone(&self.shared);
            let ctx = PassContext::new()
                .with_cancel(shutdown.clone())
                .with_timeout(self.shared.pass_timeout);
            passes.spawn(async move {
                let _permit = permit;
                let _claim = claim;
                let result = shared.pass(&key, ctx).await;
                (key, result)
            });
            dispatched += 1;
        }

        if dispatched > 0 {
            debug!(dispatched, "Dispatched reconciliation passes");
        }
        dispatched
    }
}
