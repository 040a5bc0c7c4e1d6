//! Capture side: network input, RTP checks and packet assembly

pub mod assembler;
pub mod rtp;
pub mod source;
pub mod worker;

pub use assembler::StreamAssembler;
pub use rtp::{Discontinuity, RtpSequenceTracker};
pub use source::{DatagramSource, UdpSource};
pub use worker::{CaptureStats, CaptureWorker};
