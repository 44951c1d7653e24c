use std::net::SocketAddr;

/// One resolution level of a time series: sampling step and slot count.
///
/// The retained duration (span) is always `step * slots`, so a buffer never
/// grows past its slot count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// Bucket width in seconds
    pub step_secs: i64,
    /// Number of circular slots
    pub slots: usize,
}

impl Resolution {
    pub const fn new(step_secs: i64, slots: usize) -> Self {
        Self { step_secs, slots }
    }

    /// Total retained duration in seconds.
    pub const fn span_secs(&self) -> i64 {
        self.step_secs * self.slots as i64
    }
}

/// Resolution layout for every task's time series.
///
/// Defaults mirror the classic round-robin archive scheme: a 30-hour
/// high-resolution window, a 10-day medium window at the same step, and a
/// 360-day window at daily steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesLayout {
    pub recent: Resolution,
    pub medium: Resolution,
    pub long: Resolution,
}

impl Default for SeriesLayout {
    fn default() -> Self {
        Self {
            recent: Resolution::new(3_600, 30),   // 1h step, 30h span
            medium: Resolution::new(3_600, 240),  // 1h step, 10d span
            long: Resolution::new(86_400, 360),   // 1d step, 360d span
        }
    }
}

impl SeriesLayout {
    /// Coarsest step across all resolutions; series anchors are rounded
    /// down to this boundary on creation.
    pub fn coarsest_step_secs(&self) -> i64 {
        self.recent
            .step_secs
            .max(self.medium.step_secs)
            .max(self.long.step_secs)
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Address the JSON API listens on
    pub listen_addr: SocketAddr,
    /// Silence after which a machine is declared Offline
    pub liveness_timeout_secs: i64,
    /// Interval between staleness sweeps
    pub sweep_interval_secs: u64,
    /// Maximum time a task may stay Active without a result
    pub active_deadline_secs: i64,
    /// Maximum pending+active tasks per machine
    pub task_capacity: usize,
    /// How long terminal tasks (and their series) are retained
    pub retention_secs: i64,
    pub series: SeriesLayout,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080"
                .parse()
                .expect("default listen address is valid"),
            liveness_timeout_secs: 60,
            sweep_interval_secs: 30,
            active_deadline_secs: 3_600,
            task_capacity: 15,
            retention_secs: 24 * 3_600,
            series: SeriesLayout::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_liveness_timeout(mut self, secs: i64) -> Self {
        self.liveness_timeout_secs = secs;
        self
    }

    pub fn with_active_deadline(mut self, secs: i64) -> Self {
        self.active_deadline_secs = secs;
        self
    }

    pub fn with_task_capacity(mut self, capacity: usize) -> Self {
        self.task_capacity = capacity;
        self
    }

    pub fn with_retention(mut self, secs: i64) -> Self {
        self.retention_secs = secs;
        self
    }
}
