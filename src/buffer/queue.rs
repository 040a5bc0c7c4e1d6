//! Packet hand-off between the capture thread and the writer thread
//!
//! An unbounded FIFO channel with an explicit shutdown sentinel. The sentinel
//! travels through the same channel as packets, so the writer sees every
//! packet pushed before it.

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::buffer::pool::Packet;

/// Item carried by the transfer queue
#[derive(Debug)]
enum QueueItem {
    Packet(Packet),
    Shutdown,
}

/// Producer half, owned by the capture side
pub struct QueueProducer {
    tx: Sender<QueueItem>,
}

/// Consumer half, owned by the writer thread
pub struct QueueConsumer {
    rx: Receiver<QueueItem>,
}

/// Create a connected producer/consumer pair
pub fn transfer_queue() -> (QueueProducer, QueueConsumer) {
    let (tx, rx) = unbounded();
    (QueueProducer { tx }, QueueConsumer { rx })
}

impl QueueProducer {
    /// Append a packet to the tail of the queue.
    ///
    /// Returns the packet back if the consumer is gone.
    pub fn push(&self, packet: Packet) -> Result<(), Packet> {
        match self.tx.send(QueueItem::Packet(packet)) {
            Err(e) => match e.into_inner() {
                QueueItem::Packet(p) => Err(p),
                QueueItem::Shutdown => Ok(()),
            },
            Ok(()) => Ok(()),
        }
    }

    /// Push the shutdown sentinel. The consumer stops after draining everything before it.
    pub fn push_shutdown(&self) {
        if self.tx.send(QueueItem::Shutdown).is_err() {
            tracing::debug!("Writer already gone, shutdown sentinel not delivered");
        }
    }

    /// Number of items waiting in the queue
    pub fn depth(&self) -> usize {
        self.tx.len()
    }
}

impl QueueConsumer {
    /// Block until the next packet arrives.
    ///
    /// Returns `None` on the shutdown sentinel, or when the producer was dropped
    /// and the queue is drained.
    pub fn pop(&self) -> Option<Packet> {
        match self.rx.recv() {
            Ok(QueueItem::Packet(packet)) => Some(packet),
            Ok(QueueItem::Shutdown) | Err(_) => None,
        }
    }

    /// Number of items waiting in the queue
    pub fn depth(&self) -> usize {
        self.rx.len()
    }
}
