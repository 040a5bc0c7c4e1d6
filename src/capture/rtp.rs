//! RTP sequence discontinuity detection
//!
//! Only the 16-bit sequence field at bytes 2..4 of the fixed header is
//! inspected. The payload is never parsed.

use bytes::Buf;

/// Size of the fixed RTP header stripped from every datagram
pub const RTP_HEADER_SIZE: usize = 12;

/// Datagrams that must be seen before gaps are reported
const WARMUP_DATAGRAMS: u64 = 3;

/// A detected gap in the RTP sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discontinuity {
    pub previous: u16,
    pub current: u16,
    pub lost: u16,
}

/// Tracks the last two RTP headers and reports sequence gaps
pub struct RtpSequenceTracker {
    /// Double-buffered headers, `pos` points at the slot written next
    headers: [[u8; RTP_HEADER_SIZE]; 2],
    pos: usize,
    seen: u64,
    report: bool,
    discontinuities: u64,
    lost: u64,
}

impl RtpSequenceTracker {
    /// Create a tracker. With `report` off gaps are still counted but not logged.
    pub fn new(report: bool) -> Self {
        Self {
            headers: [[0; RTP_HEADER_SIZE]; 2],
            pos: 0,
            seen: 0,
            report,
            discontinuities: 0,
            lost: 0,
        }
    }

    /// Record the header of one datagram and check it against the previous one
    pub fn observe(&mut self, header: &[u8; RTP_HEADER_SIZE]) -> Option<Discontinuity> {
        self.headers[self.pos] = *header;
        let current = sequence_of(&self.headers[self.pos]);
        let previous = sequence_of(&self.headers[self.pos ^ 1]);
        self.pos ^= 1;

        let armed = self.seen >= WARMUP_DATAGRAMS;
        self.seen += 1;

        if !armed || previous.wrapping_add(1) == current || is_benign_wrap(previous, current) {
            return None;
        }

        let gap = Discontinuity {
            previous,
            current,
            lost: current.wrapping_sub(previous).wrapping_sub(1),
        };
        self.discontinuities += 1;
        self.lost += u64::from(gap.lost);

        if self.report {
            tracing::info!(
                last_seq = gap.previous,
                curr_seq = gap.current,
                lost = gap.lost,
                "*** RTP discontinuity ***"
            );
        }

        Some(gap)
    }

    /// Datagrams observed so far
    pub fn datagrams_seen(&self) -> u64 {
        self.seen
    }

    /// Number of gaps detected
    pub fn discontinuities(&self) -> u64 {
        self.discontinuities
    }

    /// Sum of lost datagrams over all gaps
    pub fn lost_datagrams(&self) -> u64 {
        self.lost
    }
}

fn sequence_of(header: &[u8; RTP_HEADER_SIZE]) -> u16 {
    (&header[2..4]).get_u16()
}

fn is_benign_wrap(previous: u16, current: u16) -> bool {
    matches!((previous, current), (0xffff, 0) | (0, 0xffff))
}
