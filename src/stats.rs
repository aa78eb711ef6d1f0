#![forbid(unsafe_code)]

// Simulation statistics - lock-free counters shared by every user task and
// the reporter. Explicitly owned and injected, never global.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug)]
enum Gauge {
    Waiting,
    Chatting,
    Connected,
}

#[derive(Default)]
struct Inner {
    // Gauges, held by RAII guards
    waiting: AtomicU64,
    chatting: AtomicU64,
    connected: AtomicU64,

    // Transient counters, drained by the reporter each interval
    sent: AtomicU64,
    received_partner: AtomicU64,
    received_self: AtomicU64,

    // Cumulative counters
    signups: AtomicU64,
    errors: AtomicU64,
}

/// Shared statistics handle, cloned into every simulated-user task and the
/// reporting task.
#[derive(Clone, Default)]
pub struct SimStats {
    inner: Arc<Inner>,
}

/// Point-in-time view of every counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub waiting: u64,
    pub chatting: u64,
    pub connected: u64,
    pub sent: u64,
    pub received_partner: u64,
    pub received_self: u64,
    pub signups: u64,
    pub errors: u64,
}

/// Transient counters drained by one reporting interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalCounts {
    pub sent: u64,
    pub received_partner: u64,
    pub received_self: u64,
}

impl SimStats {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Gauges ---

    /// Increments `waiting` and returns a guard that decrements on drop,
    /// including on failure paths.
    pub fn waiting_guard(&self) -> GaugeGuard {
        self.guard(Gauge::Waiting)
    }

    pub fn chatting_guard(&self) -> GaugeGuard {
        self.guard(Gauge::Chatting)
    }

    pub fn connected_guard(&self) -> GaugeGuard {
        self.guard(Gauge::Connected)
    }

    fn guard(&self, gauge: Gauge) -> GaugeGuard {
        self.field(gauge).fetch_add(1, Relaxed);
        GaugeGuard {
            inner: self.inner.clone(),
            gauge,
        }
    }

    fn field(&self, gauge: Gauge) -> &AtomicU64 {
        match gauge {
            Gauge::Waiting => &self.inner.waiting,
            Gauge::Chatting => &self.inner.chatting,
            Gauge::Connected => &self.inner.connected,
        }
    }

    // --- Counters ---

    pub fn inc_sent(&self) {
        self.inner.sent.fetch_add(1, Relaxed);
    }

    pub fn inc_received(&self, from_self: bool) {
        if from_self {
            self.inner.received_self.fetch_add(1, Relaxed);
        } else {
            self.inner.received_partner.fetch_add(1, Relaxed);
        }
    }

    pub fn inc_signups(&self) {
        self.inner.signups.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors.fetch_add(1, Relaxed);
    }

    // --- Reads ---

    pub fn snapshot(&self) -> Snapshot {
        let i = &self.inner;
        Snapshot {
            waiting: i.waiting.load(Relaxed),
            chatting: i.chatting.load(Relaxed),
            connected: i.connected.load(Relaxed),
            sent: i.sent.load(Relaxed),
            received_partner: i.received_partner.load(Relaxed),
            received_self: i.received_self.load(Relaxed),
            signups: i.signups.load(Relaxed),
            errors: i.errors.load(Relaxed),
        }
    }

    /// Swaps the transient counters to zero and returns the drained values.
    /// After a drain the counters only accumulate events occurring after it,
    /// so each interval measures throughput rather than cumulative totals.
    pub fn take_interval(&self) -> IntervalCounts {
        let i = &self.inner;
        IntervalCounts {
            sent: i.sent.swap(0, Relaxed),
            received_partner: i.received_partner.swap(0, Relaxed),
            received_self: i.received_self.swap(0, Relaxed),
        }
    }
}

/// RAII guard decrementing its gauge on drop. Prevents gauge drift when a
/// user task fails mid-lifecycle.
pub struct GaugeGuard {
    inner: Arc<Inner>,
    gauge: Gauge,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        let field = match self.gauge {
            Gauge::Waiting => &self.inner.waiting,
            Gauge::Chatting => &self.inner.chatting,
            Gauge::Connected => &self.inner.connected,
        };
        field.fetch_sub(1, Relaxed);
    }
}

/// Spawns the periodic reporter: each tick drains the interval counters and
/// prints one line of gauges plus interval rates. Aborted by the driver at
/// the end of the run.
pub fn spawn_reporter(stats: SimStats, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await; // first tick completes immediately
        loop {
            interval.tick().await;
            let snap = stats.snapshot();
            let drained = stats.take_interval();
            println!(
                "waiting={} chatting={} connected={} | last {:.0}s: sent={} recv_partner={} recv_self={} | signups={} errors={}",
                snap.waiting,
                snap.chatting,
                snap.connected,
                period.as_secs_f64(),
                drained.sent,
                drained.received_partner,
                drained.received_self,
                snap.signups,
                snap.errors,
            );
        }
    })
}
