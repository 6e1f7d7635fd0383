//! Shared reconciliation counters.
//!
//! One `ReconcilerStats` aggregate is shared by every reconciler in a
//! pool. All fields are atomics so workers update them without locking,
//! and the metrics endpoint renders them into the Prometheus text
//! exposition format.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters tracking reconciliation outcomes and per-machine results.
#[derive(Debug, Default)]
pub struct ReconcilerStats {
    // Tick outcomes: exactly one is incremented per successful tick.
    pub bulk_create: AtomicU64,
    pub bulk_destroy: AtomicU64,
    pub bulk_start: AtomicU64,
    pub bulk_stop: AtomicU64,
    pub no_scale: AtomicU64,

    // Per-machine results.
    pub machine_created: AtomicU64,
    pub machine_create_failed: AtomicU64,
    pub machine_destroyed: AtomicU64,
    pub machine_destroy_failed: AtomicU64,
    pub machine_started: AtomicU64,
    pub machine_start_failed: AtomicU64,
    pub machine_stopped: AtomicU64,
    pub machine_stop_failed: AtomicU64,
}

impl ReconcilerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render the counters into Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        render_ok_failed(
            &mut out,
            "machine_create_count",
            "Machines created, by outcome.",
            self.machine_created.load(Ordering::Relaxed),
            self.machine_create_failed.load(Ordering::Relaxed),
        );
        render_ok_failed(
            &mut out,
            "machine_destroy_count",
            "Machines destroyed, by outcome.",
            self.machine_destroyed.load(Ordering::Relaxed),
            self.machine_destroy_failed.load(Ordering::Relaxed),
        );
        render_ok_failed(
            &mut out,
            "machine_start_count",
            "Machines started, by outcome.",
            self.machine_started.load(Ordering::Relaxed),
            self.machine_start_failed.load(Ordering::Relaxed),
        );
        render_ok_failed(
            &mut out,
            "machine_stop_count",
            "Machines stopped, by outcome.",
            self.machine_stopped.load(Ordering::Relaxed),
            self.machine_stop_failed.load(Ordering::Relaxed),
        );

        out.push_str("# HELP reconcile_count Reconciliation ticks, by action taken.\n");
        out.push_str("# TYPE reconcile_count counter\n");
        for (status, value) in [
            ("create", self.bulk_create.load(Ordering::Relaxed)),
            ("destroy", self.bulk_destroy.load(Ordering::Relaxed)),
            ("start", self.bulk_start.load(Ordering::Relaxed)),
            ("stop", self.bulk_stop.load(Ordering::Relaxed)),
            ("no_scale", self.no_scale.load(Ordering::Relaxed)),
        ] {
            out.push_str(&format!(
                "reconcile_count{{status=\"{status}\"}} {value}\n"
            ));
        }

        out
    }
}

fn render_ok_failed(out: &mut String, name: &str, help: &str, ok: u64, failed: u64) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} counter\n"));
    out.push_str(&format!("{name}{{status=\"ok\"}} {ok}\n"));
    out.push_str(&format!("{name}{{status=\"failed\"}} {failed}\n"));
}
