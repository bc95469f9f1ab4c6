//! Maintenance Scheduler
//!
//! Background loop with two triggers:
//!
//! - **Periodic sweep** every `sweep_interval`: purge expired entries from
//!   every tier. If the Fast tier is at or above `pressure_threshold`
//!   afterwards, a pressure eviction follows.
//! - **Memory pressure** (`signal_memory_pressure`): evict
//!   `pressure_eviction_fraction` of the Fast tier in LRU order.
//!
//! Tier operations take only the tiers' own short locks, so `get`/`set` keep
//! running during maintenance; a reader racing a removal sees a miss.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::coordinator::CacheCoordinator;
use super::tier::TierKind;
use crate::config::duration_str;

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between TTL sweeps
    #[serde(with = "duration_str")]
    pub sweep_interval: Duration,
    /// Fast tier utilization that counts as memory pressure
    pub pressure_threshold: f64,
    /// Fraction of Fast tier entries evicted under pressure
    pub pressure_eviction_fraction: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            pressure_threshold: 0.9,
            pressure_eviction_fraction: 0.5,
        }
    }
}

/// Observable scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum SchedulerState {
    Idle = 0,
    Sweeping = 1,
    Evicting = 2,
    Stopped = 3,
}

impl SchedulerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SchedulerState::Sweeping,
            2 => SchedulerState::Evicting,
            3 => SchedulerState::Stopped,
            _ => SchedulerState::Idle,
        }
    }
}

/// Result of one sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Expired entries removed, per tier
    pub removed: Vec<(TierKind, usize)>,
    /// Tiers whose purge failed (logged)
    pub failed: Vec<TierKind>,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.removed.iter().map(|(_, n)| n).sum()
    }
}

/// Background maintenance for a [`CacheCoordinator`]
pub struct MaintenanceScheduler {
    cache: Arc<CacheCoordinator>,
    config: SchedulerConfig,
    state: AtomicU8,
    pressure: Notify,
    cancel: CancellationToken,
}

impl MaintenanceScheduler {
    pub fn new(cache: Arc<CacheCoordinator>, config: SchedulerConfig) -> Arc<Self> {
        Arc::new(Self {
            cache,
            config,
            state: AtomicU8::new(SchedulerState::Idle as u8),
            pressure: Notify::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next` unless already stopped
    fn enter(&self, next: SchedulerState) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != SchedulerState::Stopped as u8).then_some(next as u8)
            });
    }

    /// Request an accelerated eviction pass
    pub fn signal_memory_pressure(&self) {
        debug!("Memory pressure signalled");
        self.pressure.notify_one();
    }

    /// Stop the background loop
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Token cancelled on shutdown
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fast tier at or above the pressure threshold
    pub fn is_under_pressure(&self) -> bool {
        self.cache
            .tier(TierKind::Fast)
            .is_some_and(|fast| fast.utilization() >= self.config.pressure_threshold)
    }

    /// Purge expired entries from every tier
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> SweepReport {
        self.enter(SchedulerState::Sweeping);

        let mut report = SweepReport::default();
        for tier in self.cache.tiers() {
            match tier.purge_expired().await {
                Ok(removed) => report.removed.push((tier.kind(), removed)),
                Err(e) => {
                    warn!(tier = %tier.kind(), error = %e, "Sweep failed for tier");
                    self.cache.metrics().record_tier_error(tier.kind());
                    report.failed.push(tier.kind());
                }
            }
        }

        let total = report.total();
        self.cache.metrics().record_swept(total);
        if total > 0 {
            debug!(removed = total, "Swept expired entries");
        }

        self.enter(SchedulerState::Idle);
        report
    }

    /// Evict the configured fraction of the Fast tier
    #[instrument(skip(self))]
    pub fn relieve_pressure(&self) -> usize {
        self.enter(SchedulerState::Evicting);

        let evicted = self
            .cache
            .tier(TierKind::Fast)
            .map_or(0, |fast| fast.shed(self.config.pressure_eviction_fraction));
        self.cache.metrics().record_pressure_evictions(evicted);
        info!(evicted, "Pressure eviction completed");

        self.enter(SchedulerState::Idle);
        evicted
    }

    /// Run until `shutdown`
    pub async fn run(self: Arc<Self>) {
        info!(
            sweep_interval = ?self.config.sweep_interval,
            pressure_threshold = self.config.pressure_threshold,
            "Starting maintenance scheduler"
        );

        let mut tick = interval(self.config.sweep_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                _ = self.pressure.notified() => {
                    self.relieve_pressure();
                }

                _ = tick.tick() => {
                    self.sweep_once().await;
                    if self.is_under_pressure() {
                        self.relieve_pressure();
                    }
                }
            }
        }

        self.state
            .store(SchedulerState::Stopped as u8, Ordering::Release);
        info!("Maintenance scheduler stopped");
    }

    /// Spawn `run` on the current runtime
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run())
    }
}

// =============================================================================
// Tests
// =============================================================================
