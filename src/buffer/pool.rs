//! Reusable packet storage
//!
//! A fixed set of preallocated slots is handed out first. When every slot is
//! in flight (the writer is behind), packets are allocated from the heap
//! instead so capture never drops data; those are freed on release.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::PoolError;

/// Where a packet's storage came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Slot(usize),
    Overflow,
}

/// A chunk of captured stream bytes, the unit handed from capture to the writer.
///
/// A packet is always owned by exactly one party: the pool, the assembler,
/// the transfer queue or the writer. It moves between them, it is never shared.
pub struct Packet {
    num: u64,
    started_at: Option<SystemTime>,
    capacity: usize,
    data: Vec<u8>,
    origin: Origin,
}

impl Packet {
    /// Packet identifier. Pool slots are numbered from 1, overflow packets continue after them.
    pub fn id(&self) -> u64 {
        self.num
    }

    /// Captured bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Current fill length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Maximum number of bytes this packet can hold
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True when the storage was allocated outside the pool
    pub fn is_allocated(&self) -> bool {
        self.origin == Origin::Overflow
    }

    /// Whether `additional` more bytes can be appended.
    ///
    /// The fill length stays strictly below capacity.
    pub fn fits(&self, additional: usize) -> bool {
        self.data.len() + additional < self.capacity
    }

    /// Append bytes. Callers check [`Packet::fits`] first.
    pub fn append(&mut self, bytes: &[u8]) {
        debug_assert!(self.fits(bytes.len()), "packet {} overfilled", self.num);
        self.data.extend_from_slice(bytes);
    }

    /// Capture start time, `None` while nothing was stamped yet
    pub fn started_at(&self) -> Option<SystemTime> {
        self.started_at
    }

    /// Stamp the capture start time if it is not set yet
    pub fn mark_started(&mut self, now: SystemTime) {
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
    }

    /// Time elapsed since the capture start, zero when unstamped or the clock went backwards
    pub fn age(&self, now: SystemTime) -> Duration {
        self.started_at
            .and_then(|start| now.duration_since(start).ok())
            .unwrap_or_default()
    }

    /// Capture start as whole seconds since the Unix epoch
    pub fn epoch_secs(&self) -> Option<i64> {
        self.started_at.map(|ts| match ts.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            Err(e) => -(e.duration().as_secs_f64().ceil() as i64),
        })
    }

    fn clear(&mut self) {
        self.started_at = None;
        self.data.clear();
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("num", &self.num)
            .field("len", &self.data.len())
            .field("capacity", &self.capacity)
            .field("started_at", &self.started_at)
            .field("allocated", &self.is_allocated())
            .finish()
    }
}

/// Packet pool shared by the capture thread (acquire) and the writer thread (release)
pub struct PacketPool {
    /// `Some` while the slot is free, `None` while its storage is lent out
    slots: Mutex<Vec<Option<Vec<u8>>>>,
    packet_capacity: usize,
    next_overflow_id: AtomicU64,
    overflow_live: AtomicUsize,
    overflow_total: AtomicU64,
}

impl PacketPool {
    /// Create a pool with `slots` preallocated packets of `packet_capacity` bytes each
    pub fn new(slots: usize, packet_capacity: usize) -> Self {
        let storage = (0..slots)
            .map(|_| Some(Vec::with_capacity(packet_capacity)))
            .collect();

        Self {
            slots: Mutex::new(storage),
            packet_capacity,
            next_overflow_id: AtomicU64::new(slots as u64 + 1),
            overflow_live: AtomicUsize::new(0),
            overflow_total: AtomicU64::new(0),
        }
    }

    /// Take the first free slot, or allocate an overflow packet when all slots are busy.
    ///
    /// Only an allocation failure is an error, and callers treat it as fatal.
    pub fn acquire(&self) -> Result<Packet, PoolError> {
        {
            let mut slots = self.slots.lock();
            if let Some((index, slot)) = slots.iter_mut().enumerate().find(|(_, s)| s.is_some()) {
                if let Some(data) = slot.take() {
                    tracing::trace!(num = index + 1, "STATIC packet");
                    return Ok(Packet {
                        num: index as u64 + 1,
                        started_at: None,
                        capacity: self.packet_capacity,
                        data,
                        origin: Origin::Slot(index),
                    });
                }
            }
        }

        let mut data = Vec::new();
        data.try_reserve_exact(self.packet_capacity)
            .map_err(|_| PoolError::Exhausted { bytes: self.packet_capacity })?;

        let num = self.next_overflow_id.fetch_add(1, Ordering::Relaxed);
        self.overflow_live.fetch_add(1, Ordering::Relaxed);
        self.overflow_total.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(num, "ALLOC packet, pool exhausted");

        Ok(Packet {
            num,
            started_at: None,
            capacity: self.packet_capacity,
            data,
            origin: Origin::Overflow,
        })
    }

    /// Return a packet. Slot storage is cleared and reused, overflow storage is freed.
    pub fn release(&self, mut packet: Packet) {
        match packet.origin {
            Origin::Slot(index) => {
                packet.clear();
                let mut slots = self.slots.lock();
                debug_assert!(slots[index].is_none(), "slot {} released twice", index);
                slots[index] = Some(packet.data);
            }
            Origin::Overflow => {
                tracing::trace!(num = packet.num, "FREE packet");
                self.overflow_live.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    /// Number of preallocated slots
    pub fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Number of slots currently lent out
    pub fn slots_in_use(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_none()).count()
    }

    /// Overflow packets currently alive
    pub fn overflow_live(&self) -> usize {
        self.overflow_live.load(Ordering::Relaxed)
    }

    /// Overflow packets allocated since the pool was created
    pub fn overflow_total(&self) -> u64 {
        self.overflow_total.load(Ordering::Relaxed)
    }

    /// Capacity of every packet handed out by this pool
    pub fn packet_capacity(&self) -> usize {
        self.packet_capacity
    }
}

/// Thread-safe handle to a packet pool
pub type SharedPacketPool = Arc<PacketPool>;

/// Create a new shared packet pool
pub fn create_shared_pool(slots: usize, packet_capacity: usize) -> SharedPacketPool {
    Arc::new(PacketPool::new(slots, packet_capacity))
}
