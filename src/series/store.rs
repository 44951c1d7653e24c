use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::SeriesLayout;
use crate::error::{HubError, Result};
use crate::series::ring::RingBuffer;
use crate::series::{Metrics, SeriesRow, Window};

/// All resolutions of one logical series.
#[derive(Debug)]
struct TaskSeries {
    /// Creation time rounded down to the coarsest step; buckets before the
    /// anchor are never reported.
    anchor: i64,
    recent: RingBuffer,
    medium: RingBuffer,
    long: RingBuffer,
}

/// Fixed-footprint, multi-resolution time-series store.
///
/// Each series carries its own lock, so `record` is serialized per series
/// but independent across series; the outer map lock is only held long
/// enough to resolve or mutate the series set.
#[derive(Debug)]
pub struct SeriesStore {
    layout: SeriesLayout,
    series: RwLock<HashMap<Uuid, Arc<Mutex<TaskSeries>>>>,
}

impl SeriesStore {
    pub fn new(layout: SeriesLayout) -> Self {
        Self {
            layout,
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn layout(&self) -> &SeriesLayout {
        &self.layout
    }

    /// Allocate the fixed-size buffers for a new series.
    pub async fn create(&self, id: Uuid, start: DateTime<Utc>) -> Result<()> {
        let mut map = self.series.write().await;
        if map.contains_key(&id) {
            return Err(HubError::SeriesExists(id));
        }
        let coarsest = self.layout.coarsest_step_secs();
        let anchor = start.timestamp().div_euclid(coarsest) * coarsest;
        map.insert(
            id,
            Arc::new(Mutex::new(TaskSeries {
                anchor,
                recent: RingBuffer::new(self.layout.recent),
                medium: RingBuffer::new(self.layout.medium),
                long: RingBuffer::new(self.layout.long),
            })),
        );
        tracing::debug!(series_id = %id, anchor, "Series created");
        Ok(())
    }

    /// Write one sample into every resolution buffer simultaneously.
    ///
    /// Validation happens before any buffer is touched, so a failed record
    /// mutates nothing.
    pub async fn record(&self, id: Uuid, metrics: &Metrics, at: DateTime<Utc>) -> Result<()> {
        metrics.validate()?;

        let series = self.resolve(id).await?;
        let mut series = series.lock().await;
        let t = at.timestamp();
        series.recent.record(t, *metrics);
        series.medium.record(t, *metrics);
        series.long.record(t, *metrics);
        Ok(())
    }

    /// Resampled rows for every bucket between `start` and `end` at the
    /// requested resolution.
    pub async fn fetch(
        &self,
        id: Uuid,
        window: Window,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SeriesRow>> {
        let series = self.resolve(id).await?;
        let series = series.lock().await;
        let ring = match window {
            Window::Recent => &series.recent,
            Window::Medium => &series.medium,
            Window::Long => &series.long,
        };
        let from = start.timestamp().max(series.anchor);
        let rows = ring
            .fetch(from, end.timestamp())
            .into_iter()
            .map(|(bucket, value)| SeriesRow {
                timestamp: Utc
                    .timestamp_opt(bucket, 0)
                    .single()
                    .unwrap_or_else(Utc::now),
                value,
            })
            .collect();
        Ok(rows)
    }

    /// Drop a series; true if it existed.
    pub async fn remove(&self, id: Uuid) -> bool {
        self.series.write().await.remove(&id).is_some()
    }

    pub async fn contains(&self, id: Uuid) -> bool {
        self.series.read().await.contains_key(&id)
    }

    async fn resolve(&self, id: Uuid) -> Result<Arc<Mutex<TaskSeries>>> {
        self.series
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(HubError::SeriesNotFound(id))
    }
}
