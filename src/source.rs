use crate::buffer::{GroupBuffer, WriteOutcome};
use crate::clock::ClockSync;
use crate::error::{Result, SourceError};
use crate::scanner::ContinuousScanner;
use crate::spikes::SpikeQueue;
use crate::traits::{NspDevice, PacketHandler};
use crate::types::{
    ContinuousChunk, GroupId, GroupPacket, NspSourceSettings, SpikeEvent, SpikePacket, MAX_GROUPS,
    UNIT_NOISE,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The protocol monitor packet leaves the Gemini hub roughly 560 usec before the
/// host stamps it; subtracting that transit time puts the pair on one timeline.
const MONITOR_TRANSIT_SEC: f64 = 560e-6;

/// How often the device's monitoring telemetry is sampled into the clock model.
const MONITOR_POLL: Duration = Duration::from_secs(1);

/// Wait granularity while a consumer task is blocked on first clock sync.
const CLOCK_WAIT: Duration = Duration::from_millis(1);

const CHUNK_CHANNEL_SIZE: usize = 64;

fn group_index(group: GroupId) -> Option<usize> {
    (1..=MAX_GROUPS as u8)
        .contains(&group)
        .then(|| group as usize - 1)
}

/// One acquisition session against an NSP device.
///
/// `connect` performs the handshake, sizes one [`GroupBuffer`] per configured
/// sample group, registers the packet handler with the transport, and spawns
/// the consumer tasks (monitor poll, continuous scanner, spike drain). The
/// emitted streams are handed out once via [`chunks`](Self::chunks) and
/// [`spikes`](Self::spikes); restarting mid-session is not supported, a new
/// session means a new `connect`.
pub struct NspSource {
    device: Arc<dyn NspDevice>,
    clock: Arc<ClockSync>,
    buffers: [Option<Arc<GroupBuffer>>; MAX_GROUPS],
    chunk_rx: Option<mpsc::Receiver<ContinuousChunk>>,
    spike_rx: Option<mpsc::UnboundedReceiver<SpikeEvent>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl NspSource {
    pub async fn connect(device: Arc<dyn NspDevice>, settings: NspSourceSettings) -> Result<Self> {
        device.connect()?;

        let sysfreq = device.sample_frequency();
        let clock = Arc::new(ClockSync::new(settings.alpha, sysfreq));

        let buffers: [Option<Arc<GroupBuffer>>; MAX_GROUPS] = std::array::from_fn(|i| {
            let group = (i + 1) as GroupId;
            let channels = device.group_channels(group);
            if channels.is_empty() {
                return None;
            }
            let rate = device.group_rate(group);
            let scales: Vec<f64> = channels.iter().map(|&ch| device.channel_scale(ch)).collect();
            let buffer = Arc::new(GroupBuffer::new(
                group,
                settings.buffer_dur,
                rate,
                channels.len(),
                scales,
            ));
            info!(
                group,
                rate,
                channels = channels.len(),
                capacity = buffer.capacity(),
                "configured sample group"
            );
            Some(buffer)
        });

        let spike_queue = Arc::new(SpikeQueue::new());
        let handler = Arc::new(SourceHandler {
            buffers: buffers.clone(),
            spike_queue: spike_queue.clone(),
            device: device.clone(),
        });
        device.register_handler(handler);

        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CHANNEL_SIZE);
        let (spike_tx, spike_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let scanner = ContinuousScanner::new(
            buffers.iter().flatten().cloned().collect(),
            clock.clone(),
            settings.cbtime,
            settings.microvolts,
            chunk_tx,
            shutdown_rx.clone(),
        );

        let tasks = vec![
            tokio::spawn(run_monitor(
                device.clone(),
                clock.clone(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(scanner.run()),
            tokio::spawn(run_spike_drain(
                spike_queue,
                clock.clone(),
                settings.cbtime,
                spike_tx,
                shutdown_rx,
            )),
        ];

        info!(sysfreq, "NSP source session started");
        Ok(Self {
            device,
            clock,
            buffers,
            chunk_rx: Some(chunk_rx),
            spike_rx: Some(spike_rx),
            shutdown_tx,
            tasks,
        })
    }

    /// Take the continuous-data stream. Yields `None` after the first call.
    pub fn chunks(&mut self) -> Option<mpsc::Receiver<ContinuousChunk>> {
        self.chunk_rx.take()
    }

    /// Take the spike-event stream. Yields `None` after the first call.
    pub fn spikes(&mut self) -> Option<mpsc::UnboundedReceiver<SpikeEvent>> {
        self.spike_rx.take()
    }

    pub fn clock(&self) -> Arc<ClockSync> {
        self.clock.clone()
    }

    /// Rows lost to producer overrun on one group since the session started.
    pub fn overflow_count(&self, group: GroupId) -> Result<u64> {
        group_index(group)
            .and_then(|i| self.buffers[i].as_ref())
            .map(|b| b.overflow_count())
            .ok_or(SourceError::UnknownGroup(group))
    }

    /// Tear the session down: stop the consumer tasks, then unregister the
    /// transport callbacks, then drop the buffers. The order matters; the
    /// producer must not outlive the storage it writes into.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.device.unregister_handler();
        self.device.disconnect();
        info!("NSP source session closed");
    }
}

/// The callback boundary. Runs on the transport's receive thread: every path
/// here is a short buffered write or queue push.
struct SourceHandler {
    buffers: [Option<Arc<GroupBuffer>>; MAX_GROUPS],
    spike_queue: Arc<SpikeQueue>,
    device: Arc<dyn NspDevice>,
}

impl SourceHandler {
    fn scales_for(&self, group: GroupId, n_channels: usize) -> Vec<f64> {
        let channels = self.device.group_channels(group);
        if channels.len() == n_channels {
            channels
                .iter()
                .map(|&ch| self.device.channel_scale(ch))
                .collect()
        } else {
            // Config cache hasn't caught up with the new shape yet; unity
            // gains until the next reconfiguration.
            vec![1.0; n_channels]
        }
    }
}

impl PacketHandler for SourceHandler {
    fn on_sample(&self, packet: GroupPacket) {
        let Some(buffer) = group_index(packet.group).and_then(|i| self.buffers[i].as_ref())
        else {
            debug!(group = packet.group, "dropping packet for unconfigured group");
            return;
        };

        if buffer.write(packet.tick, &packet.samples) == WriteOutcome::Reconfigured {
            warn!(
                group = packet.group,
                channels = packet.samples.len(),
                "group shape changed; discarding buffered data"
            );
            // The buffer reshaped itself with unity gains and the old rate;
            // install the device's current rate and gains before the next row.
            let rate = self.device.group_rate(packet.group);
            let scales = self.scales_for(packet.group, packet.samples.len());
            buffer.reconfigure(rate, packet.samples.len(), scales);
        }
    }

    fn on_spike(&self, packet: SpikePacket) {
        self.spike_queue.push(packet);
    }
}

/// Feed the clock model from the device's monitoring telemetry, about once per
/// second.
async fn run_monitor(
    device: Arc<dyn NspDevice>,
    clock: Arc<ClockSync>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(MONITOR_POLL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Some((tick, host)) = device.monitor_sample() {
                    clock.add_pair(tick, host - MONITOR_TRANSIT_SEC);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("monitor task stopped");
}

/// Drain the spike queue, translate timestamps, and forward events downstream.
async fn run_spike_drain(
    queue: Arc<SpikeQueue>,
    clock: Arc<ClockSync>,
    cbtime: bool,
    spike_tx: mpsc::UnboundedSender<SpikeEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let packet = tokio::select! {
            popped = queue.pop_wait() => match popped {
                Some(packet) => packet,
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        // Host-clock mode cannot timestamp anything before the first monitor
        // sample; the queue absorbs the startup burst.
        while !cbtime && !clock.is_ready() {
            tokio::select! {
                _ = tokio::time::sleep(CLOCK_WAIT) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }

        let timestamp = if cbtime {
            packet.tick as f64 / clock.sysfreq()
        } else {
            match clock.device_to_host(packet.tick) {
                Ok(t) => t,
                Err(_) => continue,
            }
        };

        let event = SpikeEvent {
            channel: packet.channel,
            timestamp,
            // 0 is unsorted and 1..=5 are sorted units; the device reserves
            // higher ids for noise.
            unit: if packet.unit > 5 { UNIT_NOISE } else { packet.unit },
        };
        if spike_tx.send(event).is_err() {
            debug!("spike receiver dropped; drain stopping");
            break;
        }
    }
    debug!("spike drain stopped");
}
