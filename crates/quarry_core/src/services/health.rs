//! Periodic liveness checks for connected pool entries.
//!
//! One timer task per connected entry. A timer skips ticks while its entry is
//! dialing, and ends on the first failed check or when the entry leaves the
//! connected state. Pool events restart and stop timers.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::ConnectionStatus;
use crate::services::pool::{PoolEvent, PoolManager};

/// Health check interval. Not configurable.
pub const HEALTH_CHECK_PERIOD: Duration = Duration::from_secs(30);

struct Timer {
    generation: u64,
    token: CancellationToken,
}

type Timers = Arc<Mutex<HashMap<Uuid, Timer>>>;

/// Supervises health timers for every connected entry of a pool.
pub struct HealthMonitor {
    pool: Arc<PoolManager>,
    period: Duration,
    timers: Timers,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl HealthMonitor {
    /// Start watching `pool`. Must be called inside a tokio runtime.
    pub fn spawn(pool: Arc<PoolManager>) -> Arc<Self> {
        Self::spawn_with_period(pool, HEALTH_CHECK_PERIOD)
    }

    pub(crate) fn spawn_with_period(pool: Arc<PoolManager>, period: Duration) -> Arc<Self> {
        let events = pool.subscribe();
        let monitor = Arc::new(Self {
            pool,
            period,
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        for id in monitor.pool.connected_ids() {
            monitor.start(id);
        }
        tokio::spawn(Arc::clone(&monitor).listen(events));

        tracing::debug!(period_secs = period.as_secs(), "Health monitor started");
        monitor
    }

    async fn listen(self: Arc<Self>, mut events: broadcast::Receiver<PoolEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(PoolEvent::Connected(id)) => self.start(id),
                Ok(PoolEvent::Disconnected(id) | PoolEvent::Removed(id)) => self.stop(id),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Health monitor lagged behind pool events, resyncing");
                    self.resync();
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// Start (or restart) the timer for `id`.
    fn start(&self, id: Uuid) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let token = self.shutdown.child_token();
        let previous = self.timers.lock().insert(id, Timer { generation, token: token.clone() });
        if let Some(previous) = previous {
            previous.token.cancel();
        }

        tokio::spawn(tick(
            Arc::clone(&self.pool),
            id,
            self.period,
            token,
            generation,
            Arc::clone(&self.timers),
        ));
    }

    fn stop(&self, id: Uuid) {
        if let Some(timer) = self.timers.lock().remove(&id) {
            timer.token.cancel();
            tracing::trace!(connection_id = %id, "Health timer stopped");
        }
    }

    fn resync(&self) {
        let connected = self.pool.connected_ids();
        let stale: Vec<Uuid> =
            self.timers.lock().keys().filter(|id| !connected.contains(id)).copied().collect();
        for id in stale {
            self.stop(id);
        }
        for id in connected {
            if !self.is_watching(id) {
                self.start(id);
            }
        }
    }

    pub fn is_watching(&self, id: Uuid) -> bool {
        self.timers.lock().contains_key(&id)
    }

    pub fn watched(&self) -> Vec<Uuid> {
        self.timers.lock().keys().copied().collect()
    }

    /// Cancel every timer and stop listening.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.timers.lock().clear();
        tracing::debug!("Health monitor stopped");
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn tick(
    pool: Arc<PoolManager>,
    id: Uuid,
    period: Duration,
    token: CancellationToken,
    generation: u64,
    timers: Timers,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = interval.tick() => {}
        }

        let status = pool.status(id).status;
        if status.is_dialing() {
            tracing::trace!(connection_id = %id, "Skipping health check while dialing");
            continue;
        }
        if status != ConnectionStatus::Connected {
            break;
        }
        if !pool.health_check(id).await.success {
            break;
        }
    }

    let mut timers = timers.lock();
    if timers.get(&id).is_some_and(|t| t.generation == generation) {
        timers.remove(&id);
    }
}
