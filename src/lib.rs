//! Real-time telemetry source for Blackrock NSP / Gemini neural signal processors.
//!
//! The device transport delivers decoded packets by invoking callbacks on its own
//! receive thread. This crate buffers that data without blocking the callback,
//! reconciles the device sample clock with host wall-clock time, and republishes
//! everything as timestamped [`ContinuousChunk`] and [`SpikeEvent`] messages on
//! tokio channels for a downstream publishing layer.

pub mod buffer;
pub mod clock;
pub mod error;
pub mod scanner;
pub mod source;
pub mod spikes;
pub mod traits;
pub mod types;

pub use buffer::{DrainedRun, GroupBuffer, WriteOutcome};
pub use clock::ClockSync;
pub use error::{Result, SourceError};
pub use scanner::ContinuousScanner;
pub use source::NspSource;
pub use spikes::SpikeQueue;
pub use traits::{NspDevice, PacketHandler};
pub use types::*;
