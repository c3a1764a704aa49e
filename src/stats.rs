//! Event counters. One process-wide registry, initialized lazily on first
//! pool creation, tracks totals and current-period values; a collector task
//! derives per-second averages every period. Counter polling is lock-free,
//! so re-entrant reads from callbacks are safe.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use log::info;
use once_cell::sync::Lazy;

/// Collection period for the per-second averages, in milliseconds.
static STAT_PERIOD: u64 = 15000;

/// The process-wide counter registry.
pub static COUNTERS: Lazy<Arc<DriverCounters>> =
    Lazy::new(|| Arc::new(DriverCounters::default()));

static COLLECTOR_STARTED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Default)]
pub struct CounterFields {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub commands: AtomicU64,
}

#[derive(Debug, Default)]
pub struct DriverCounters {
    pub total: CounterFields,
    current: CounterFields,
    pub averages: CounterFields,

    pub current_commands: AtomicU64,
    pub failed_commands: AtomicU64,
    pub prepared_commands: AtomicU64,

    pub pools: AtomicUsize,
    pub idle_connections: AtomicUsize,
    pub busy_connections: AtomicUsize,

    pub multiplexing_batches_sent: AtomicU64,
    pub multiplexing_batch_commands: AtomicU64,
    pub multiplexing_batch_write_micros: AtomicU64,
}

impl DriverCounters {
    #[inline(always)]
    pub fn bytes_sent_add(&self, bytes: u64) {
        self.total.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.current.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn bytes_received_add(&self, bytes: u64) {
        self.total.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.current.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn command_started(&self) {
        self.total.commands.fetch_add(1, Ordering::Relaxed);
        self.current.commands.fetch_add(1, Ordering::Relaxed);
        self.current_commands.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn command_completed(&self) {
        self.current_commands.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn command_failed(&self) {
        self.failed_commands.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn command_was_prepared(&self) {
        self.prepared_commands.fetch_add(1, Ordering::Relaxed);
    }

    /// Fraction of commands that went through a prepared statement.
    pub fn prepared_ratio(&self) -> f64 {
        let total = self.total.commands.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.prepared_commands.load(Ordering::Relaxed) as f64 / total as f64
    }

    pub fn multiplexing_batch_sent(&self, commands: u64, write_micros: u64) {
        self.multiplexing_batches_sent.fetch_add(1, Ordering::Relaxed);
        self.multiplexing_batch_commands
            .fetch_add(commands, Ordering::Relaxed);
        self.multiplexing_batch_write_micros
            .fetch_add(write_micros, Ordering::Relaxed);
    }

    /// Average commands per multiplexing batch since process start.
    pub fn commands_per_batch(&self) -> f64 {
        let batches = self.multiplexing_batches_sent.load(Ordering::Relaxed);
        if batches == 0 {
            return 0.0;
        }
        self.multiplexing_batch_commands.load(Ordering::Relaxed) as f64 / batches as f64
    }

    /// Average multiplexing write time per batch, in microseconds.
    pub fn average_write_micros_per_batch(&self) -> f64 {
        let batches = self.multiplexing_batches_sent.load(Ordering::Relaxed);
        if batches == 0 {
            return 0.0;
        }
        self.multiplexing_batch_write_micros.load(Ordering::Relaxed) as f64 / batches as f64
    }

    fn update_averages(&self) {
        let period_seconds = (STAT_PERIOD / 1000).max(1);
        for (average, current) in [
            (&self.averages.bytes_sent, &self.current.bytes_sent),
            (&self.averages.bytes_received, &self.current.bytes_received),
            (&self.averages.commands, &self.current.commands),
        ] {
            average.store(
                current.load(Ordering::Relaxed) / period_seconds,
                Ordering::Relaxed,
            );
        }
    }

    fn reset_current(&self) {
        self.current.bytes_sent.store(0, Ordering::Relaxed);
        self.current.bytes_received.store(0, Ordering::Relaxed);
        self.current.commands.store(0, Ordering::Relaxed);
    }
}

/// Gauges for one pool, summed into the global registry as they change.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub idle: AtomicUsize,
    pub busy: AtomicUsize,
    pub waiting: AtomicUsize,
}

impl PoolStats {
    pub fn connector_rented(&self) {
        self.busy.fetch_add(1, Ordering::Relaxed);
        COUNTERS.busy_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connector_released(&self) {
        self.busy.fetch_sub(1, Ordering::Relaxed);
        COUNTERS.busy_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn idle_added(&self) {
        self.idle.fetch_add(1, Ordering::Relaxed);
        COUNTERS.idle_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn idle_removed(&self) {
        self.idle.fetch_sub(1, Ordering::Relaxed);
        COUNTERS.idle_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn idle_count(&self) -> usize {
        self.idle.load(Ordering::Relaxed)
    }

    pub fn busy_count(&self) -> usize {
        self.busy.load(Ordering::Relaxed)
    }
}

/// Start the averages collector once. Called from pool creation; tolerates
/// repeated calls and being invoked outside a runtime (it just waits for
/// the next opportunity).
pub fn ensure_collector() {
    if COLLECTOR_STARTED.swap(true, Ordering::SeqCst) {
        return;
    }
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        COLLECTOR_STARTED.store(false, Ordering::SeqCst);
        return;
    };
    info!("Events reporter started");
    handle.spawn(async {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_millis(STAT_PERIOD));
        // The first tick fires immediately; skip it so the first period is
        // a full one.
        interval.tick().await;
        loop {
            interval.tick().await;
            COUNTERS.update_averages();
            COUNTERS.reset_current();
        }
    });
}
