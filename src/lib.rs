//! # TS Recorder
//!
//! Unattended capture of an MPEG transport stream received over UDP or
//! RTP/UDP (usually multicast) into time-rotated files.
//!
//! ## Architecture Overview
//!
//! ```text
//!  capture thread
//!  ┌────────────┐   ┌──────────────────┐   ┌──────────────────────────┐
//!  │ UdpSource  │──▶│ RTP header strip │──▶│      StreamAssembler     │
//!  │ (socket2)  │   │ + sequence check │   │ fill until full or stale │
//!  └────────────┘   └──────────────────┘   └─────┬──────────────▲─────┘
//!                                                │ push         │ acquire
//!                                                ▼              │
//!                            transfer queue (FIFO + sentinel)  PacketPool
//!                                                │        (16 slots + heap)
//!  writer thread                                 ▼              ▲ release
//!  ┌───────────────┐   ┌────────────────────────────────────────┴─────┐
//!  │ QueueConsumer │──▶│ FileRotator                                  │
//!  └───────────────┘   │   PREFIX-YYYYMMDD_HHMMSS-EPOCH.ts            │
//!                      │   + hard link in YYYY/MM/DD/HH when enabled  │
//!                      └──────────────────────────────────────────────┘
//! ```

pub mod buffer;
pub mod capture;
pub mod config;
pub mod error;
pub mod recorder;
pub mod storage;

pub use config::AppConfig;
pub use error::{Error, Result};
pub use recorder::{Recorder, RecorderStats};

/// Application-wide constants
pub mod constants {
    /// One datagram carries 7 transport stream packets of 188 bytes
    pub const FRAME_SIZE: usize = 7 * 188;

    /// Packet capacity, about 1.2 MB or one second of a 10 Mbit/s stream
    pub const PACKET_MAX_LENGTH: usize = FRAME_SIZE * 1024;

    /// Maximum packet fill time in milliseconds
    pub const PACKET_MAX_TIME_MS: u64 = 1000;

    /// Preallocated packets in the pool
    pub const NUM_PACKETS: usize = 16;

    /// File name prefixes must be shorter than this
    pub const PREFIX_MAX_LENGTH: usize = 64;

    /// Default rotation interval in seconds
    pub const DEFAULT_ROTATE_SECS: u64 = 60;

    /// Default socket read timeout in milliseconds
    pub const DEFAULT_READ_TIMEOUT_MS: u64 = 250;

    /// Socket receive buffer, about 4 MB in whole frames
    pub const DEFAULT_RECV_BUFFER_SIZE: usize = (4_000_000 / FRAME_SIZE) * FRAME_SIZE;
}
