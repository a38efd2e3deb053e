//! Scheduler loop: reactive per-user triggers plus a periodic sweep.
//!
//! Enqueues nudge the loop through an mpsc channel when a partition
//! crosses the batch threshold or its oldest item has waited too long;
//! the sweep picks up everything else. At most one pass runs per user
//! at a time, and a panic inside one user's pass never takes down the
//! loop or other users.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use futures::FutureExt;
use tokio::sync::{broadcast, mpsc};

use crate::dispatch::Dispatcher;
use crate::queue::NotificationQueue;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub sweep_interval: Duration,
    pub trigger_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(15),
            trigger_capacity: 256,
        }
    }
}

pub struct SchedulerTask {
    dispatcher: Arc<Dispatcher>,
    queue: Arc<NotificationQueue>,
    /// Users with a pass currently in flight
    active: Arc<DashSet<String>>,
    trigger_rx: mpsc::Receiver<String>,
    shutdown_rx: broadcast::Receiver<()>,
    config: SchedulerConfig,
}

impl SchedulerTask {
    /// Build the task and wire its trigger channel into the queue.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        queue: Arc<NotificationQueue>,
        config: SchedulerConfig,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(config.trigger_capacity.max(1));
        queue.attach_trigger(trigger_tx);
        Self {
            dispatcher,
            queue,
            active: Arc::new(DashSet::new()),
            trigger_rx,
            shutdown_rx,
            config,
        }
    }

    pub async fn run(mut self) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            "Scheduler loop started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    tracing::info!("Scheduler loop stopping");
                    break;
                }
                trigger = self.trigger_rx.recv() => {
                    match trigger {
                        Some(user_id) => self.spawn_user_pass(user_id),
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    /// Spawn a pass for one user unless one is already running. A held
    /// guard is a no-op, not an error.
    fn spawn_user_pass(&self, user_id: String) {
        if !self.active.insert(user_id.clone()) {
            return;
        }

        let dispatcher = self.dispatcher.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            let pass = std::panic::AssertUnwindSafe(dispatcher.run_user_pass(&user_id))
                .catch_unwind()
                .await;
            if pass.is_err() {
                tracing::error!(user_id = %user_id, "Batch pass panicked");
            }
            active.remove(&user_id);
        });
    }

    async fn sweep(&self) {
        let global = std::panic::AssertUnwindSafe(self.dispatcher.run_global_pass())
            .catch_unwind()
            .await;
        if global.is_err() {
            tracing::error!("Global pass panicked");
        }

        for user_id in self.queue.users_with_pending().await {
            self.spawn_user_pass(user_id);
        }
    }
}
