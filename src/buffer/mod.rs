//! Packet storage and the capture-to-writer hand-off

pub mod pool;
pub mod queue;

pub use pool::{create_shared_pool, Packet, PacketPool, SharedPacketPool};
pub use queue::{transfer_queue, QueueConsumer, QueueProducer};
