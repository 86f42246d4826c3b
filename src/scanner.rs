use crate::buffer::{DrainedRun, GroupBuffer};
use crate::clock::ClockSync;
use crate::types::{ContinuousChunk, GroupId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// How long the scanner sleeps after a full pass that found no data. The
/// producer side is a callback, not a pollable handle, so there is nothing to
/// block on; a short sleep bounds both wake-up latency and idle CPU burn.
const IDLE_POLL: Duration = Duration::from_millis(1);

/// Consumer-side polling loop over all active group buffers.
///
/// Each pass visits the groups in a fixed round-robin order, drains whatever
/// each buffer has accumulated, timestamps the leading tick, and emits one
/// [`ContinuousChunk`] per non-empty drain. A pass that yields nothing anywhere
/// idles for [`IDLE_POLL`]; a productive pass rolls straight into the next one
/// since more data may already be waiting.
///
/// Chunks within one group come out in write order; no cross-group ordering is
/// guaranteed beyond that.
pub struct ContinuousScanner {
    buffers: Vec<Arc<GroupBuffer>>,
    clock: Arc<ClockSync>,
    /// Emit device-native timestamps (`tick / sysfreq`) instead of host time.
    cbtime: bool,
    /// Apply per-channel gains, producing microvolts instead of ADC counts.
    microvolts: bool,
    chunk_tx: mpsc::Sender<ContinuousChunk>,
    shutdown: watch::Receiver<bool>,
}

impl ContinuousScanner {
    pub fn new(
        buffers: Vec<Arc<GroupBuffer>>,
        clock: Arc<ClockSync>,
        cbtime: bool,
        microvolts: bool,
        chunk_tx: mpsc::Sender<ContinuousChunk>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            buffers,
            clock,
            cbtime,
            microvolts,
            chunk_tx,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            // Host-clock mode needs an offset estimate before any tick can be
            // converted, so hold off draining until the first monitor sample.
            if !self.cbtime && !self.clock.is_ready() {
                if self.idle_wait().await {
                    break;
                }
                continue;
            }

            let mut yielded = false;
            for buffer in &self.buffers {
                let Some(run) = buffer.drain() else {
                    continue;
                };
                let chunk = self.make_chunk(buffer.group(), run);
                if self.chunk_tx.send(chunk).await.is_err() {
                    debug!("chunk receiver dropped; scanner stopping");
                    return;
                }
                yielded = true;
            }

            if !yielded && self.idle_wait().await {
                break;
            }
        }
        debug!("continuous scanner stopped");
    }

    /// Sleep one idle interval, waking early on shutdown. Returns true when the
    /// loop should stop.
    async fn idle_wait(&mut self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(IDLE_POLL) => false,
            changed = self.shutdown.changed() => {
                changed.is_err() || *self.shutdown.borrow()
            }
        }
    }

    /// Gains and rate come from the run's own snapshot, captured under the
    /// buffer lock at drain time, so a reconfiguration racing this call cannot
    /// pair old-shape rows with new-shape config.
    fn make_chunk(&self, group: GroupId, run: DrainedRun) -> ContinuousChunk {
        let leading_tick = run.ticks[0];
        let start_time = if self.cbtime {
            leading_tick as f64 / self.clock.sysfreq()
        } else {
            // is_ready() was checked before draining and the offset never
            // becomes unset again, so this cannot fail here.
            self.clock
                .device_to_host(leading_tick)
                .unwrap_or_else(|_| leading_tick as f64 / self.clock.sysfreq())
        };

        let data: Vec<Vec<f32>> = if self.microvolts {
            run.rows
                .iter()
                .map(|row| {
                    row.iter()
                        .zip(&run.scales)
                        .map(|(&s, &gain)| (s as f64 * gain) as f32)
                        .collect()
                })
                .collect()
        } else {
            run.rows
                .iter()
                .map(|row| row.iter().map(|&s| s as f32).collect())
                .collect()
        };

        ContinuousChunk {
            group,
            data,
            start_time,
            sample_rate: run.sample_rate,
        }
    }
}
