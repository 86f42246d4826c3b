use crate::types::SpikePacket;
use tokio::sync::{mpsc, Mutex};

/// Unbounded FIFO hand-off of spike packets from the transport callback to the
/// drain task.
///
/// `push` never blocks the callback thread; `pop_wait` suspends the single
/// consumer until a packet arrives. Arrival order is preserved exactly. The
/// queue is deliberately unbounded: spike rates are small next to continuous
/// data, and a consumer that stalls indefinitely shows up as memory growth
/// rather than dropped events.
pub struct SpikeQueue {
    tx: mpsc::UnboundedSender<SpikePacket>,
    rx: Mutex<mpsc::UnboundedReceiver<SpikePacket>>,
}

impl SpikeQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Enqueue one packet from the producer context. Never blocks.
    pub fn push(&self, packet: SpikePacket) {
        // Only fails when the receiver half is gone, i.e. during teardown.
        let _ = self.tx.send(packet);
    }

    /// Await the next packet in arrival order. Single-consumer; the mutex is
    /// uncontended in normal operation and exists so the queue can be shared
    /// behind an `Arc` with the producer side.
    pub async fn pop_wait(&self) -> Option<SpikePacket> {
        self.rx.lock().await.recv().await
    }
}

impl Default for SpikeQueue {
    fn default() -> Self {
        Self::new()
    }
}
