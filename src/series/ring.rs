use crate::config::Resolution;
use crate::series::Metrics;

/// A fixed-capacity circular buffer over time buckets.
///
/// The slot for time `t` is `floor(t/step) mod slots`; writing a newer
/// bucket into an occupied slot silently evicts the old value. Each slot
/// remembers the bucket start it was written for, so a read can tell a live
/// value apart from a stale one left by an evicted epoch.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    step_secs: i64,
    slots: Vec<Option<Slot>>,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    /// Unix seconds of the bucket start this slot currently holds
    bucket: i64,
    value: Metrics,
}

impl RingBuffer {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            step_secs: resolution.step_secs,
            slots: vec![None; resolution.slots],
        }
    }

    pub fn step_secs(&self) -> i64 {
        self.step_secs
    }

    pub fn span_secs(&self) -> i64 {
        self.step_secs * self.slots.len() as i64
    }

    /// Bucket start for a given unix timestamp.
    pub fn bucket(&self, t: i64) -> i64 {
        t.div_euclid(self.step_secs) * self.step_secs
    }

    fn index(&self, t: i64) -> usize {
        t.div_euclid(self.step_secs).rem_euclid(self.slots.len() as i64) as usize
    }

    /// Write a sample at time `t`, overwriting whatever the slot held.
    pub fn record(&mut self, t: i64, value: Metrics) {
        let bucket = self.bucket(t);
        let index = self.index(t);
        self.slots[index] = Some(Slot { bucket, value });
    }

    /// Ordered `(bucket_start, value)` rows for every bucket between `start`
    /// and `end` inclusive, clamped to the buffer's span.
    ///
    /// A bucket whose slot was never written, or whose slot has been reused
    /// by a different epoch, yields `None`. Values are rounded to two
    /// decimals on the way out.
    pub fn fetch(&self, start: i64, end: i64) -> Vec<(i64, Option<Metrics>)> {
        if end < start {
            return Vec::new();
        }
        let end_bucket = self.bucket(end);
        let mut start_bucket = self.bucket(start);
        let oldest = end_bucket - self.span_secs() + self.step_secs;
        if start_bucket < oldest {
            start_bucket = oldest;
        }

        let mut rows = Vec::new();
        let mut bucket = start_bucket;
        while bucket <= end_bucket {
            let value = match self.slots[self.index(bucket)] {
                Some(slot) if slot.bucket == bucket => Some(slot.value.rounded()),
                _ => None,
            };
            rows.push((bucket, value));
            bucket += self.step_secs;
        }
        rows
    }
}
