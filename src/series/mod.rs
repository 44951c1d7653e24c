pub mod ring;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HubError, Result};

/// One measurement sample: throughput in Mbps, latency/jitter in ms,
/// packet loss in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub download: f64,
    pub upload: f64,
    pub latency: f64,
    pub jitter: f64,
    pub loss: f64,
}

/// Upper bound for throughput values, matching the archive's gauge range.
const MAX_THROUGHPUT: f64 = 10_000.0;
/// Upper bound for latency and jitter in milliseconds.
const MAX_LATENCY: f64 = 1_000.0;

impl Metrics {
    /// Basic range validation: non-negative and finite everywhere, jitter
    /// and latency bounded, loss a percentage.
    pub fn validate(&self) -> Result<()> {
        let check = |name: &str, value: f64, max: f64| -> Result<()> {
            if !value.is_finite() {
                return Err(HubError::InvalidValue(format!("{name} is not finite")));
            }
            if value < 0.0 || value > max {
                return Err(HubError::InvalidValue(format!(
                    "{name} out of range: {value}"
                )));
            }
            Ok(())
        };
        check("download", self.download, MAX_THROUGHPUT)?;
        check("upload", self.upload, MAX_THROUGHPUT)?;
        check("latency", self.latency, MAX_LATENCY)?;
        check("jitter", self.jitter, MAX_LATENCY)?;
        check("loss", self.loss, 100.0)?;
        Ok(())
    }

    /// Copy with every field rounded to two decimal places (read-side policy).
    pub fn rounded(&self) -> Metrics {
        Metrics {
            download: round2(self.download),
            upload: round2(self.upload),
            latency: round2(self.latency),
            jitter: round2(self.jitter),
            loss: round2(self.loss),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Which resolution window of a series to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    Recent,
    Medium,
    Long,
}

impl std::str::FromStr for Window {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "recent" => Ok(Window::Recent),
            "medium" => Ok(Window::Medium),
            "long" => Ok(Window::Long),
            other => Err(HubError::InvalidValue(format!("unknown window: {other}"))),
        }
    }
}

/// One resampled row: the bucket timestamp and the value written there, or
/// `None` for a slot that was never written or has been evicted.
///
/// The null/zero distinction is load-bearing: downstream averaging must skip
/// `None`, not treat it as zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeriesRow {
    pub timestamp: DateTime<Utc>,
    pub value: Option<Metrics>,
}
