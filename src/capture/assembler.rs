//! Stream assembler
//!
//! Accumulates datagram payloads into the current packet and hands complete
//! packets to the writer. A packet is complete when the next chunk would not
//! fit, or when it has been filling for longer than the configured window.

use std::time::{Duration, SystemTime};

use crate::buffer::{Packet, QueueProducer, SharedPacketPool};
use crate::error::PoolError;

/// Why a packet was handed to the writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Size,
    Time,
}

/// Counters kept by the assembler
#[derive(Debug, Clone, Default)]
pub struct AssemblerStats {
    pub bytes_in: u64,
    pub packets_flushed: u64,
    pub size_flushes: u64,
    pub time_flushes: u64,
}

/// Fills packets from the pool and pushes them onto the transfer queue
pub struct StreamAssembler {
    pool: SharedPacketPool,
    queue: QueueProducer,
    current: Packet,
    max_fill_time: Duration,
    stats: AssemblerStats,
}

impl StreamAssembler {
    /// Create an assembler, taking its first packet from the pool
    pub fn new(
        pool: SharedPacketPool,
        queue: QueueProducer,
        max_fill_time: Duration,
    ) -> Result<Self, PoolError> {
        let current = pool.acquire()?;
        Ok(Self {
            pool,
            queue,
            current,
            max_fill_time,
            stats: AssemblerStats::default(),
        })
    }

    /// Append received bytes, stamping with the system clock
    pub fn push(&mut self, data: &[u8]) -> Result<(), PoolError> {
        self.push_at(data, SystemTime::now())
    }

    /// Append received bytes as of `now`
    pub fn push_at(&mut self, data: &[u8], now: SystemTime) -> Result<(), PoolError> {
        if data.is_empty() {
            return Ok(());
        }
        self.stats.bytes_in += data.len() as u64;

        // A packet holds at most capacity - 1 bytes; oversize chunks are split.
        let max_chunk = self.current.capacity().saturating_sub(1).max(1);
        let mut flushed_for_size = false;
        for chunk in data.chunks(max_chunk) {
            if !self.current.fits(chunk.len()) {
                tracing::debug!(
                    fill = self.current.len(),
                    incoming = chunk.len(),
                    capacity = self.current.capacity(),
                    "*** Reached buffer end"
                );
                self.flush(FlushReason::Size)?;
                flushed_for_size = true;
            }
            self.current.append(chunk);
            self.current.mark_started(now);
        }

        // A packet started by the size flush above was stamped `now` and can not be stale.
        if !flushed_for_size {
            self.flush_if_stale(now)?;
        }
        Ok(())
    }

    /// Flush the current packet when it has been filling longer than the window
    pub fn flush_if_stale(&mut self, now: SystemTime) -> Result<bool, PoolError> {
        let age = self.current.age(now);
        if self.current.is_empty() || age <= self.max_fill_time {
            return Ok(false);
        }
        tracing::debug!(
            age_ms = age.as_millis() as u64,
            limit_ms = self.max_fill_time.as_millis() as u64,
            "+++ Reached time limit"
        );
        self.flush(FlushReason::Time)
    }

    /// Flush whatever is buffered and push the shutdown sentinel
    pub fn finish(self) -> AssemblerStats {
        let Self { pool, queue, current, mut stats, .. } = self;

        if current.is_empty() {
            pool.release(current);
        } else {
            tracing::debug!(num = current.id(), len = current.len(), "Flushing last packet");
            stats.packets_flushed += 1;
            if let Err(packet) = queue.push(current) {
                tracing::warn!(
                    num = packet.id(),
                    len = packet.len(),
                    "Writer gone, packet dropped"
                );
                pool.release(packet);
            }
        }
        queue.push_shutdown();
        stats
    }

    /// Hand the current packet to the queue and start a new one.
    ///
    /// Empty packets are never queued; the current packet is kept instead.
    fn flush(&mut self, reason: FlushReason) -> Result<bool, PoolError> {
        if self.current.is_empty() {
            return Ok(false);
        }

        let next = self.pool.acquire()?;
        let full = std::mem::replace(&mut self.current, next);

        tracing::trace!(
            num = full.id(),
            len = full.len(),
            ?reason,
            depth = self.queue.depth(),
            "Packet queued"
        );

        self.stats.packets_flushed += 1;
        match reason {
            FlushReason::Size => self.stats.size_flushes += 1,
            FlushReason::Time => self.stats.time_flushes += 1,
        }

        if let Err(packet) = self.queue.push(full) {
            tracing::warn!(num = packet.id(), len = packet.len(), "Writer gone, packet dropped");
            self.pool.release(packet);
        }
        Ok(true)
    }

    /// The packet currently being filled
    pub fn current(&self) -> &Packet {
        &self.current
    }

    /// Items waiting for the writer
    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    pub fn stats(&self) -> &AssemblerStats {
        &self.stats
    }
}
