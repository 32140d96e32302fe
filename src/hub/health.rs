//! Health counters for the shared pipeline

use std::sync::atomic::{AtomicU64, Ordering};

fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Activity metrics of a [`SharedPipeline`](super::SharedPipeline)
///
/// All fields use atomic operations so the streaming thread can record bus
/// errors while the control thread records attachments.
pub struct HubHealth {
    pub sources_created: AtomicU64,
    pub sources_removed: AtomicU64,
    pub attachments: AtomicU64,
    pub connect_failures: AtomicU64,
    pub detachments: AtomicU64,
    /// Branches removed after a completed drain
    pub branches_drained: AtomicU64,
    /// Branches removed by the fallback timeout
    pub forced_teardowns: AtomicU64,
    pub bus_errors: AtomicU64,
    /// Timestamp (as Unix microseconds) of the last attach or detach
    pub last_activity: AtomicU64,
}

impl HubHealth {
    pub fn new() -> Self {
        Self {
            sources_created: AtomicU64::new(0),
            sources_removed: AtomicU64::new(0),
            attachments: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            detachments: AtomicU64::new(0),
            branches_drained: AtomicU64::new(0),
            forced_teardowns: AtomicU64::new(0),
            bus_errors: AtomicU64::new(0),
            last_activity: AtomicU64::new(now_micros()),
        }
    }

    fn touch(&self) {
        self.last_activity.store(now_micros(), Ordering::Relaxed);
    }

    pub fn record_attach(&self, created_source: bool) {
        self.attachments.fetch_add(1, Ordering::Relaxed);
        if created_source {
            self.sources_created.fetch_add(1, Ordering::Relaxed);
        }
        self.touch();
    }

    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_detach(&self) {
        self.detachments.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_branch_removed(&self, forced: bool) {
        if forced {
            self.forced_teardowns.fetch_add(1, Ordering::Relaxed);
        } else {
            self.branches_drained.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_source_removed(&self) {
        self.sources_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bus_error(&self) {
        self.bus_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn forced_teardowns(&self) -> u64 {
        self.forced_teardowns.load(Ordering::Relaxed)
    }

    pub fn bus_errors(&self) -> u64 {
        self.bus_errors.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> HealthSummary {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        HealthSummary {
            sources_created: load(&self.sources_created),
            sources_removed: load(&self.sources_removed),
            attachments: load(&self.attachments),
            connect_failures: load(&self.connect_failures),
            detachments: load(&self.detachments),
            branches_drained: load(&self.branches_drained),
            forced_teardowns: load(&self.forced_teardowns),
            bus_errors: load(&self.bus_errors),
        }
    }
}

impl Default for HubHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSummary {
    pub sources_created: u64,
    pub sources_removed: u64,
    pub attachments: u64,
    pub connect_failures: u64,
    pub detachments: u64,
    pub branches_drained: u64,
    pub forced_teardowns: u64,
    pub bus_errors: u64,
}

impl HealthSummary {
    /// Sources created and not yet removed
    pub fn live_sources(&self) -> u64 {
        self.sources_created.saturating_sub(self.sources_removed)
    }
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} live sources ({} created), {} attaches ({} failed), {} detaches, {} drained, {} forced, {} bus errors",
            self.live_sources(),
            self.sources_created,
            self.attachments,
            self.connect_failures,
            self.detachments,
            self.branches_drained,
            self.forced_teardowns,
            self.bus_errors
        )
    }
}

/// Health alert types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthAlert {
    /// Teardowns had to be forced since the last check
    ForcedTeardowns { count: u64 },
    /// Errors were posted on the pipeline bus since the last check
    BusErrors { count: u64 },
}

impl std::fmt::Display for HealthAlert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthAlert::ForcedTeardowns { count } => {
                write!(f, "{} teardown(s) forced by timeout", count)
            }
            HealthAlert::BusErrors { count } => write!(f, "Bus errors: {}", count),
        }
    }
}

/// Reports counters that grew since the previous check
#[derive(Default)]
pub struct HealthMonitor {
    last_forced: u64,
    last_errors: u64,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, health: &HubHealth) -> Vec<HealthAlert> {
        let mut alerts = Vec::new();

        let forced = health.forced_teardowns();
        if forced > self.last_forced {
            alerts.push(HealthAlert::ForcedTeardowns {
                count: forced - self.last_forced,
            });
            self.last_forced = forced;
        }

        let errors = health.bus_errors();
        if errors > self.last_errors {
            alerts.push(HealthAlert::BusErrors {
                count: errors - self.last_errors,
            });
            self.last_errors = errors;
        }

        alerts
    }
}
