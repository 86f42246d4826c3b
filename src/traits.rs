use crate::error::Result;
use crate::types::{ChannelId, GroupId, GroupPacket, SpikePacket};
use std::sync::Arc;

/// Callback boundary between the transport's receive thread and this crate.
///
/// The transport invokes these methods synchronously inside its hardware receive
/// path, so implementations must return within a few instructions' worth of
/// work: a buffered write or a queue push, never I/O or an unbounded wait.
pub trait PacketHandler: Send + Sync {
    fn on_sample(&self, packet: GroupPacket);
    fn on_spike(&self, packet: SpikePacket);
}

/// Capabilities this crate consumes from the device transport.
///
/// The transport owns the wire protocol, packet parsing, and channel
/// configuration discovery; this trait exposes only the already-decoded results.
/// Configuration getters are queried at (re)configuration time and may be called
/// from inside a [`PacketHandler`] callback, so they must answer from a local
/// cache rather than a round-trip to the device.
pub trait NspDevice: Send + Sync {
    /// Perform the initial handshake. Failure is fatal to the session; any retry
    /// policy belongs to the caller.
    fn connect(&self) -> Result<()>;

    fn disconnect(&self);

    /// Install the handler invoked for every decoded group or spike packet.
    fn register_handler(&self, handler: Arc<dyn PacketHandler>);

    fn unregister_handler(&self);

    /// Ordered channel membership of a sample group. Empty when the group is
    /// not configured.
    fn group_channels(&self, group: GroupId) -> Vec<ChannelId>;

    /// Sampling rate of a group in Hz.
    fn group_rate(&self, group: GroupId) -> f64;

    /// Multiplier converting a channel's raw ADC counts to microvolts.
    fn channel_scale(&self, channel: ChannelId) -> f64;

    /// Rate of the device's global sample counter in ticks per second.
    fn sample_frequency(&self) -> f64;

    /// Latest clock correspondence point from the device's monitoring telemetry:
    /// a device tick paired with the host time the monitor packet was stamped.
    /// `None` until the first monitor packet arrives.
    fn monitor_sample(&self) -> Option<(u64, f64)>;
}
