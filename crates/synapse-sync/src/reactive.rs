//! # Reactive Scheduler
//!
//! Keeps computed configuration keys current.
//!
//! ## Binding Task
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  spawn(uid, key, binding)                                              │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  evaluate ◄──────────────┬───────────────────┬────────────────────┐    │
//! │     │                    │                   │                    │    │
//! │     │              interval tick     dependency `update`     nudge    │
//! │     ▼                                (EventBus listener)   (after boot)│
//! │  candidate == current ? ── yes ──► skip                                │
//! │     │ no                                                                │
//! │     ▼                                                                   │
//! │  registry.set(uid, key, candidate)                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Bindings without a trigger of their own run on the default cadence.
//! Tasks hold only a weak reference to the registry and stop once it is
//! dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, trace};

use synapse_core::{EntityEvent, ReactiveBinding};

use crate::events::{EventBus, SubscriptionId};
use crate::registry::StorageRegistry;

struct BindingTask {
    key: String,
    nudge: mpsc::UnboundedSender<()>,
    subscriptions: Vec<SubscriptionId>,
    handle: JoinHandle<()>,
}

/// Owns one background task per reactive binding.
pub struct ReactiveScheduler {
    events: Arc<EventBus>,
    default_interval: Duration,
    tasks: Mutex<HashMap<String, Vec<BindingTask>>>,
}

impl ReactiveScheduler {
    pub fn new(events: Arc<EventBus>, default_interval: Duration) -> Self {
        Self {
            events,
            default_interval,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, Vec<BindingTask>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn default_interval(&self) -> Duration {
        self.default_interval
    }

    /// Starts the task for one binding. The first evaluation runs right away.
    pub fn spawn(
        &self,
        registry: Weak<StorageRegistry>,
        unique_id: &str,
        key: &str,
        binding: ReactiveBinding,
    ) {
        let (nudge, triggers) = mpsc::unbounded_channel();

        let subscriptions = binding
            .dependencies()
            .iter()
            .map(|dependency| {
                let trigger = nudge.clone();
                self.events.subscribe(dependency, EntityEvent::Update, move |_| {
                    let _ = trigger.send(());
                })
            })
            .collect();

        let period = if binding.uses_default_cadence() {
            Some(self.default_interval)
        } else {
            binding.interval()
        };

        debug!(
            unique_id = %unique_id,
            key = %key,
            ?period,
            dependencies = binding.dependencies().len(),
            "Starting reactive binding"
        );

        let handle = tokio::spawn(run_binding(
            registry,
            unique_id.to_string(),
            key.to_string(),
            binding,
            period,
            triggers,
        ));

        self.tasks()
            .entry(unique_id.to_string())
            .or_default()
            .push(BindingTask {
                key: key.to_string(),
                nudge,
                subscriptions,
                handle,
            });
    }

    /// Re-evaluates every binding of `unique_id` now.
    pub fn nudge(&self, unique_id: &str) {
        if let Some(tasks) = self.tasks().get(unique_id) {
            for task in tasks {
                trace!(unique_id = %unique_id, key = %task.key, "Nudging reactive binding");
                let _ = task.nudge.send(());
            }
        }
    }

    /// Number of live binding tasks.
    pub fn binding_count(&self) -> usize {
        self.tasks().values().map(Vec::len).sum()
    }

    /// Stops every binding task and drops its dependency listeners.
    pub fn shutdown(&self) {
        let tasks: Vec<BindingTask> = self.tasks().drain().flat_map(|(_, tasks)| tasks).collect();
        for task in tasks {
            for id in task.subscriptions {
                self.events.unsubscribe(id);
            }
            task.handle.abort();
        }
    }
}

impl Drop for ReactiveScheduler {
    fn drop(&mut self) {
        for task in self.tasks().values().flatten() {
            task.handle.abort();
        }
    }
}

async fn run_binding(
    registry: Weak<StorageRegistry>,
    unique_id: String,
    key: String,
    binding: ReactiveBinding,
    period: Option<Duration>,
    mut triggers: mpsc::UnboundedReceiver<()>,
) {
    let mut ticker = period.map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        let Some(strong) = registry.upgrade() else {
            break;
        };
        evaluate(&strong, &unique_id, &key, &binding).await;
        drop(strong);

        tokio::select! {
            _ = async {
                match ticker.as_mut() {
                    Some(ticker) => {
                        ticker.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {}
            trigger = triggers.recv() => {
                if trigger.is_none() {
                    break;
                }
                // Collapse a burst of triggers into one evaluation.
                while triggers.try_recv().is_ok() {}
            }
        }
    }

    trace!(unique_id = %unique_id, key = %key, "Reactive binding stopped");
}

async fn evaluate(registry: &StorageRegistry, unique_id: &str, key: &str, binding: &ReactiveBinding) {
    let candidate = binding.compute();

    if registry.get(unique_id, key).as_ref() == Some(&candidate) {
        trace!(unique_id = %unique_id, key = %key, "Reactive value unchanged");
        return;
    }

    if let Err(e) = registry.set(unique_id, key, candidate).await {
        error!(unique_id = %unique_id, key = %key, error = %e, "Reactive update failed");
    }
}
