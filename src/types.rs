use serde::{Deserialize, Serialize};

/// Sample group identifier on the device (1-based, at most [`MAX_GROUPS`]).
pub type GroupId = u8;

/// Device channel identifier.
pub type ChannelId = u16;

/// Number of concurrently sampled channel groups a device can run.
pub const MAX_GROUPS: usize = 6;

/// Unit id of an unsorted spike.
pub const UNIT_UNSORTED: u8 = 0;

/// Unit id assigned to spikes the device classified as noise. Sorted units are
/// 1..=5; anything higher maps here.
pub const UNIT_NOISE: u8 = 255;

/// One decoded continuous-data packet: a single sample row for one group.
#[derive(Debug, Clone)]
pub struct GroupPacket {
    pub group: GroupId,
    /// Device sample counter at this sample.
    pub tick: u64,
    /// One raw integer sample per channel in the group, in membership order.
    pub samples: Vec<i16>,
}

/// One decoded spike packet.
#[derive(Debug, Clone, Copy)]
pub struct SpikePacket {
    pub channel: ChannelId,
    /// Device sample counter at the spike threshold crossing.
    pub tick: u64,
    /// Sorted unit id as reported by the device.
    pub unit: u8,
}

/// A spike event with its timestamp already translated for the consumer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpikeEvent {
    pub channel: ChannelId,
    /// Host seconds, or device seconds when the source runs in `cbtime` mode.
    pub timestamp: f64,
    /// [`UNIT_UNSORTED`], 1..=5 for sorted units, or [`UNIT_NOISE`].
    pub unit: u8,
}

/// One batch of contiguous samples for one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuousChunk {
    pub group: GroupId,
    /// Rows are samples, columns are channels. Scaled to microvolts when the
    /// source runs with `microvolts` enabled, otherwise raw ADC counts.
    pub data: Vec<Vec<f32>>,
    /// Timestamp of the first row: host seconds, or device seconds in `cbtime` mode.
    pub start_time: f64,
    /// Sampling rate of this group in Hz.
    pub sample_rate: f64,
}

impl ContinuousChunk {
    pub fn n_samples(&self) -> usize {
        self.data.len()
    }

    pub fn n_channels(&self) -> usize {
        self.data.first().map(Vec::len).unwrap_or(0)
    }
}

/// Source configuration.
///
/// Transport-level parameters (addresses, ports, protocol version) belong to the
/// [`crate::traits::NspDevice`] implementation, not to this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NspSourceSettings {
    /// Seconds of continuous data each group buffer can hold before the oldest
    /// unread samples are overwritten.
    pub buffer_dur: f64,
    /// Scale samples to microvolts using per-channel gains from the device.
    pub microvolts: bool,
    /// Emit device-native timestamps instead of host-clock-converted ones.
    pub cbtime: bool,
    /// Smoothing factor for the clock offset estimate, in (0, 1].
    pub alpha: f64,
}

impl Default for NspSourceSettings {
    fn default() -> Self {
        Self {
            buffer_dur: 1.0,
            microvolts: true,
            cbtime: false,
            alpha: 0.1,
        }
    }
}
