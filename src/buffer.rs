use crate::types::GroupId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Outcome of a [`GroupBuffer::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Stored,
    /// The row's channel count did not match the buffer shape. The buffer was
    /// reconfigured for the new width (unread data and the mismatched row both
    /// discarded, scale factors reset to unity); the owner should follow up
    /// with [`GroupBuffer::reconfigure`] to install real gains and the group's
    /// current rate.
    Reconfigured,
}

/// One contiguous run of unread samples returned by [`GroupBuffer::drain`].
///
/// Carries a snapshot of the gains and rate that were in effect when the rows
/// were captured, taken under the same lock as the copy, so a reconfiguration
/// racing the consumer cannot pair old-shape rows with new-shape config.
#[derive(Debug, Clone)]
pub struct DrainedRun {
    /// Device tick of each row.
    pub ticks: Vec<u64>,
    /// Raw ADC counts, rows x channels.
    pub rows: Vec<Vec<i16>>,
    /// Per-channel gains at capture time, one per column.
    pub scales: Vec<f64>,
    /// Group sampling rate at capture time, in Hz.
    pub sample_rate: f64,
}

/// Fixed-capacity circular buffer of (tick, sample row) pairs for one sample
/// group, written from the transport callback and drained by the scanner task.
///
/// Capacity is `floor(buffer_dur * sample_rate)` rows. A producer that laps the
/// consumer silently overwrites the oldest unread rows; the loss is bounded by
/// the capacity and observable through [`overflow_count`](Self::overflow_count).
///
/// Both sides take one mutex, held only for a row copy (write) or a contiguous
/// slice copy (drain), so the callback is never blocked behind I/O or an
/// unbounded wait.
pub struct GroupBuffer {
    group: GroupId,
    buffer_dur: f64,
    overflows: AtomicU64,
    inner: Mutex<Inner>,
}

struct Inner {
    sample_rate: f64,
    capacity: usize,
    n_channels: usize,
    ticks: Vec<u64>,
    /// Row-major, `capacity * n_channels`.
    samples: Vec<i16>,
    scales: Vec<f64>,
    write_cursor: usize,
    read_cursor: usize,
    /// Rows written but not yet drained. Distinguishes a full ring from an
    /// empty one when the cursors coincide.
    unread: usize,
}

impl Inner {
    fn reconfigure(&mut self, sample_rate: f64, n_channels: usize, mut scales: Vec<f64>, buffer_dur: f64) {
        let capacity = ((buffer_dur * sample_rate).floor() as usize).max(1);
        scales.resize(n_channels, 1.0);
        self.sample_rate = sample_rate;
        self.capacity = capacity;
        self.n_channels = n_channels;
        self.ticks = vec![0; capacity];
        self.samples = vec![0; capacity * n_channels];
        self.scales = scales;
        self.write_cursor = 0;
        self.read_cursor = 0;
        self.unread = 0;
    }
}

impl GroupBuffer {
    pub fn new(
        group: GroupId,
        buffer_dur: f64,
        sample_rate: f64,
        n_channels: usize,
        scales: Vec<f64>,
    ) -> Self {
        let mut inner = Inner {
            sample_rate: 0.0,
            capacity: 0,
            n_channels: 0,
            ticks: Vec::new(),
            samples: Vec::new(),
            scales: Vec::new(),
            write_cursor: 0,
            read_cursor: 0,
            unread: 0,
        };
        inner.reconfigure(sample_rate, n_channels, scales, buffer_dur);
        Self {
            group,
            buffer_dur,
            overflows: AtomicU64::new(0),
            inner: Mutex::new(inner),
        }
    }

    /// Store one sample row. Producer side only.
    ///
    /// A row whose length differs from the configured channel count
    /// reconfigures the buffer instead of storing: unread data and the row
    /// itself are discarded, cursors reset, gains reset to unity. This is the
    /// only non-constant-time path. Overwriting unread data is not an error;
    /// the oldest rows are dropped and the overflow counter bumped.
    pub fn write(&self, tick: u64, row: &[i16]) -> WriteOutcome {
        let mut inner = self.inner.lock();

        if row.len() != inner.n_channels {
            debug!(
                group = self.group,
                from = inner.n_channels,
                to = row.len(),
                "channel count changed; reconfiguring group buffer"
            );
            let rate = inner.sample_rate;
            inner.reconfigure(rate, row.len(), vec![1.0; row.len()], self.buffer_dur);
            return WriteOutcome::Reconfigured;
        }

        let w = inner.write_cursor;
        let nch = inner.n_channels;
        inner.ticks[w] = tick;
        inner.samples[w * nch..(w + 1) * nch].copy_from_slice(row);
        inner.write_cursor = (w + 1) % inner.capacity;

        if inner.unread == inner.capacity {
            // Lapped the consumer: the oldest unread row was just overwritten.
            inner.read_cursor = inner.write_cursor;
            self.overflows.fetch_add(1, Ordering::Relaxed);
        } else {
            inner.unread += 1;
        }
        WriteOutcome::Stored
    }

    /// Return the contiguous run of unread rows starting at the read cursor, or
    /// `None` when nothing new is available. Consumer side only.
    ///
    /// A run never wraps: when unread data spans the end of the ring, this call
    /// returns the tail up to the physical end and the next call returns the
    /// wrapped remainder.
    ///
    /// The lock is held only for two flat copies and the cursor update; the
    /// per-row split happens after it is released, so a producer `write`
    /// arriving mid-drain waits for a memcpy, not a row-by-row rebuild.
    pub fn drain(&self) -> Option<DrainedRun> {
        let (ticks, flat, nch, scales, sample_rate) = {
            let mut inner = self.inner.lock();
            if inner.unread == 0 {
                return None;
            }

            let r = inner.read_cursor;
            let n = inner.unread.min(inner.capacity - r);
            let nch = inner.n_channels;

            let ticks = inner.ticks[r..r + n].to_vec();
            let flat = inner.samples[r * nch..(r + n) * nch].to_vec();

            inner.read_cursor = (r + n) % inner.capacity;
            inner.unread -= n;
            (ticks, flat, nch, inner.scales.clone(), inner.sample_rate)
        };

        let rows = flat.chunks(nch).map(|row| row.to_vec()).collect();
        Some(DrainedRun {
            ticks,
            rows,
            scales,
            sample_rate,
        })
    }

    /// Reshape the buffer for a new rate, channel count, and scale factors.
    /// Discards any unread data and resets both cursors.
    pub fn reconfigure(&self, sample_rate: f64, n_channels: usize, scales: Vec<f64>) {
        self.inner
            .lock()
            .reconfigure(sample_rate, n_channels, scales, self.buffer_dur);
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn channel_count(&self) -> usize {
        self.inner.lock().n_channels
    }

    pub fn sample_rate(&self) -> f64 {
        self.inner.lock().sample_rate
    }

    pub fn scales(&self) -> Vec<f64> {
        self.inner.lock().scales.clone()
    }

    /// Number of rows lost to the producer lapping the consumer since creation.
    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with_capacity(capacity: usize, n_channels: usize) -> GroupBuffer {
        // 1 Hz rate makes capacity == buffer_dur, keeping tests legible.
        GroupBuffer::new(1, capacity as f64, 1.0, n_channels, vec![1.0; n_channels])
    }

    #[test]
    fn capacity_is_floor_of_duration_times_rate() {
        let buf = GroupBuffer::new(1, 0.5, 30_000.0, 4, vec![1.0; 4]);
        assert_eq!(buf.capacity(), 15_000);

        let buf = GroupBuffer::new(2, 0.1, 499.0, 1, vec![1.0]);
        assert_eq!(buf.capacity(), 49);
    }

    #[test]
    fn drain_returns_written_rows_in_order() {
        let buf = buffer_with_capacity(8, 2);
        for (i, tick) in [10u64, 20, 30].iter().enumerate() {
            let v = (i + 1) as i16;
            assert_eq!(buf.write(*tick, &[v, v]), WriteOutcome::Stored);
        }

        let run = buf.drain().expect("data available");
        assert_eq!(run.ticks, vec![10, 20, 30]);
        assert_eq!(run.rows, vec![vec![1, 1], vec![2, 2], vec![3, 3]]);
        assert!(buf.drain().is_none());
    }

    #[test]
    fn drain_after_partial_read_picks_up_new_rows() {
        let buf = buffer_with_capacity(4, 2);
        buf.write(10, &[1, 1]);
        buf.write(20, &[2, 2]);
        buf.write(30, &[3, 3]);

        let run = buf.drain().unwrap();
        assert_eq!(run.ticks, vec![10, 20, 30]);

        buf.write(40, &[4, 4]);
        let run = buf.drain().unwrap();
        assert_eq!(run.ticks, vec![40]);
        assert_eq!(run.rows, vec![vec![4, 4]]);
    }

    #[test]
    fn wrapped_data_arrives_over_two_drains() {
        let buf = buffer_with_capacity(4, 1);
        buf.write(1, &[1]);
        buf.write(2, &[2]);
        buf.write(3, &[3]);
        buf.drain().unwrap();

        // Cursors at 3; these three rows wrap past the end of the ring.
        buf.write(4, &[4]);
        buf.write(5, &[5]);
        buf.write(6, &[6]);

        let first = buf.drain().unwrap();
        assert_eq!(first.ticks, vec![4]);
        let second = buf.drain().unwrap();
        assert_eq!(second.ticks, vec![5, 6]);
        assert!(buf.drain().is_none());
    }

    #[test]
    fn overflow_keeps_last_capacity_rows() {
        let capacity = 5;
        let k = 3;
        let buf = buffer_with_capacity(capacity, 1);
        for i in 0..(capacity + k) as i16 {
            buf.write(i as u64, &[i]);
        }
        assert_eq!(buf.overflow_count(), k as u64);

        let mut ticks = Vec::new();
        while let Some(run) = buf.drain() {
            ticks.extend(run.ticks);
        }
        // Oldest k rows lost, last `capacity` rows survive in write order.
        assert_eq!(ticks, vec![3, 4, 5, 6, 7]);
    }

    #[test]
    fn mismatched_row_reconfigures_and_discards_unread() {
        let buf = buffer_with_capacity(6, 2);
        buf.write(10, &[1, 1]);
        buf.write(20, &[2, 2]);

        assert_eq!(buf.write(30, &[7, 8, 9]), WriteOutcome::Reconfigured);
        assert_eq!(buf.channel_count(), 3);
        assert_eq!(buf.scales(), vec![1.0, 1.0, 1.0]);
        // The mismatched row is discarded along with the unread data.
        assert!(buf.drain().is_none());

        assert_eq!(buf.write(40, &[7, 8, 9]), WriteOutcome::Stored);
        let run = buf.drain().unwrap();
        assert_eq!(run.ticks, vec![40]);
        assert_eq!(run.rows, vec![vec![7, 8, 9]]);
    }

    #[test]
    fn drained_run_snapshots_scales_and_rate() {
        let buf = GroupBuffer::new(1, 1.0, 1000.0, 3, vec![1.0, 2.0, 3.0]);
        buf.write(10, &[10, 20, 30]);

        let run = buf.drain().unwrap();
        // A reconfiguration landing after the drain must not leak into the run.
        buf.reconfigure(500.0, 2, vec![9.0, 9.0]);

        assert_eq!(run.rows, vec![vec![10, 20, 30]]);
        assert_eq!(run.scales, vec![1.0, 2.0, 3.0]);
        assert_eq!(run.sample_rate, 1000.0);
        assert_eq!(buf.channel_count(), 2);
        assert_eq!(buf.sample_rate(), 500.0);
    }

    #[test]
    fn multichannel_wrap_keeps_row_boundaries() {
        let buf = buffer_with_capacity(4, 3);
        buf.write(1, &[1, 2, 3]);
        buf.write(2, &[4, 5, 6]);
        buf.write(3, &[7, 8, 9]);
        buf.drain().unwrap();

        // Cursors at 3; these rows span the physical end of the ring.
        buf.write(4, &[10, 11, 12]);
        buf.write(5, &[13, 14, 15]);

        let first = buf.drain().unwrap();
        assert_eq!(first.ticks, vec![4]);
        assert_eq!(first.rows, vec![vec![10, 11, 12]]);
        let second = buf.drain().unwrap();
        assert_eq!(second.ticks, vec![5]);
        assert_eq!(second.rows, vec![vec![13, 14, 15]]);
    }

    #[test]
    fn explicit_reconfigure_recomputes_capacity_for_new_rate() {
        let buf = GroupBuffer::new(3, 2.0, 1000.0, 2, vec![0.25, 0.25]);
        assert_eq!(buf.capacity(), 2000);
        buf.write(1, &[1, 1]);

        buf.reconfigure(500.0, 4, vec![0.5; 4]);
        assert_eq!(buf.capacity(), 1000);
        assert_eq!(buf.channel_count(), 4);
        assert_eq!(buf.sample_rate(), 500.0);
        assert!(buf.drain().is_none());
    }

    #[test]
    fn full_buffer_drains_completely() {
        let capacity = 4;
        let buf = buffer_with_capacity(capacity, 1);
        for i in 0..capacity as i16 {
            buf.write(i as u64, &[i]);
        }
        assert_eq!(buf.overflow_count(), 0);

        let run = buf.drain().unwrap();
        assert_eq!(run.ticks.len(), capacity);
        assert!(buf.drain().is_none());
    }
}
