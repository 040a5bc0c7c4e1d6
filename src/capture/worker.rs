//! Capture loop
//!
//! Reads datagrams from the input, strips and checks RTP headers, and feeds
//! the payload to the stream assembler. Runs on the caller's thread until the
//! shared running flag is cleared.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, SystemTime};

use crate::capture::assembler::{AssemblerStats, StreamAssembler};
use crate::capture::rtp::{RtpSequenceTracker, RTP_HEADER_SIZE};
use crate::capture::source::{is_timeout, DatagramSource};
use crate::config::InputKind;
use crate::error::PoolError;

/// Pause after a read error that is not a timeout, so a broken socket does not spin
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Capture counters
#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    pub datagrams: u64,
    /// Payload bytes handed to the assembler
    pub bytes_read: u64,
    pub read_timeouts: u64,
    pub read_errors: u64,
    pub runt_datagrams: u64,
    pub rtp_discontinuities: u64,
    pub rtp_lost: u64,
    pub assembler: AssemblerStats,
}

/// Drives one datagram source into the assembler
pub struct CaptureWorker<S: DatagramSource> {
    source: S,
    kind: InputKind,
    rtp: Option<RtpSequenceTracker>,
    assembler: StreamAssembler,
    scratch: Vec<u8>,
    data_received: bool,
    stats: CaptureStats,
}

impl<S: DatagramSource> CaptureWorker<S> {
    /// Create a worker. `report_discontinuity` only matters for RTP input.
    pub fn new(
        source: S,
        kind: InputKind,
        report_discontinuity: bool,
        assembler: StreamAssembler,
    ) -> Self {
        let rtp = match kind {
            InputKind::Rtp => Some(RtpSequenceTracker::new(report_discontinuity)),
            InputKind::Udp => None,
        };

        Self {
            source,
            kind,
            rtp,
            assembler,
            scratch: vec![0u8; kind.max_datagram()],
            data_received: false,
            stats: CaptureStats::default(),
        }
    }

    /// Read until `running` is cleared, then flush and push the shutdown sentinel.
    ///
    /// Only a buffer allocation failure ends the loop early; it is returned as
    /// the error and the writer sees the queue close.
    pub fn run(mut self, running: &AtomicBool) -> Result<CaptureStats, PoolError> {
        while running.load(Ordering::SeqCst) {
            self.poll_once()?;
        }

        let Self { assembler, mut stats, rtp, .. } = self;
        if let Some(rtp) = rtp {
            stats.rtp_discontinuities = rtp.discontinuities();
            stats.rtp_lost = rtp.lost_datagrams();
        }
        stats.assembler = assembler.finish();
        Ok(stats)
    }

    /// Perform one read and process its result
    pub fn poll_once(&mut self) -> Result<(), PoolError> {
        match self.source.recv(&mut self.scratch) {
            Ok(len) => self.on_datagram(len),
            Err(e) if is_timeout(&e) => {
                tracing::info!(" *** Input read timeout ***");
                self.data_received = false;
                self.stats.read_timeouts += 1;
                self.assembler.flush_if_stale(SystemTime::now())?;
                Ok(())
            }
            Err(e) => {
                self.stats.read_errors += 1;
                tracing::warn!("Input read error: {}", e);
                self.assembler.flush_if_stale(SystemTime::now())?;
                thread::sleep(READ_ERROR_BACKOFF);
                Ok(())
            }
        }
    }

    fn on_datagram(&mut self, len: usize) -> Result<(), PoolError> {
        if len == 0 {
            return Ok(());
        }
        self.stats.datagrams += 1;

        let payload = match self.kind {
            InputKind::Udp => &self.scratch[..len],
            InputKind::Rtp => {
                if len <= RTP_HEADER_SIZE {
                    self.stats.runt_datagrams += 1;
                    tracing::debug!(len, "RTP datagram without payload dropped");
                    return Ok(());
                }
                let mut header = [0u8; RTP_HEADER_SIZE];
                header.copy_from_slice(&self.scratch[..RTP_HEADER_SIZE]);
                if let Some(rtp) = self.rtp.as_mut() {
                    rtp.observe(&header);
                }
                &self.scratch[RTP_HEADER_SIZE..len]
            }
        };

        if !self.data_received {
            tracing::info!("Data received.");
            self.data_received = true;
        }

        self.stats.bytes_read += payload.len() as u64;
        self.assembler.push(payload)
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{create_shared_pool, transfer_queue, QueueConsumer};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Arc;

    /// Plays back scripted reads, then times out and clears the flag
    struct Scripted<'a> {
        reads: VecDeque<io::Result<Vec<u8>>>,
        running: &'a AtomicBool,
    }

    impl DatagramSource for Scripted<'_> {
        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => {
                    self.running.store(false, Ordering::SeqCst);
                    Err(io::ErrorKind::WouldBlock.into())
                }
            }
        }
    }

    fn rtp_datagram(seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut d = vec![0x80, 33];
        d.extend_from_slice(&seq.to_be_bytes());
        d.extend_from_slice(&[0; 8]);
        d.extend_from_slice(payload);
        d
    }

    fn collect(consumer: &QueueConsumer) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(packet) = consumer.pop() {
            out.extend_from_slice(packet.data());
        }
        out
    }

    fn assembler() -> (StreamAssembler, QueueConsumer) {
        let pool = create_shared_pool(4, 64 * 1024);
        let (producer, consumer) = transfer_queue();
        (
            StreamAssembler::new(pool, producer, Duration::from_secs(1)).unwrap(),
            consumer,
        )
    }

    #[test]
    fn test_udp_payload_passes_through() {
        let running = AtomicBool::new(true);
        let (assembler, consumer) = assembler();
        let source = Scripted {
            reads: VecDeque::from(vec![
                Ok(vec![0x47; 188]),
                Err(io::ErrorKind::TimedOut.into()),
                Ok(vec![0x48; 188]),
            ]),
            running: &running,
        };

        let stats = CaptureWorker::new(source, InputKind::Udp, true, assembler)
            .run(&running)
            .unwrap();

        assert_eq!(stats.datagrams, 2);
        assert_eq!(stats.bytes_read, 376);
        assert_eq!(stats.read_timeouts, 2);

        let data = collect(&consumer);
        assert_eq!(data.len(), 376);
        assert_eq!(data[0], 0x47);
        assert_eq!(data[188], 0x48);
    }

    #[test]
    fn test_rtp_header_is_stripped_and_gaps_counted() {
        let running = AtomicBool::new(true);
        let (assembler, consumer) = assembler();
        let reads = [1u16, 2, 3, 5, 6]
            .iter()
            .map(|&seq| Ok(rtp_datagram(seq, &[seq as u8; 4])))
            .chain(std::iter::once(Ok(vec![0x80, 33, 0, 7])))
            .collect();
        let source = Scripted { reads, running: &running };

        let stats = CaptureWorker::new(source, InputKind::Rtp, false, assembler)
            .run(&running)
            .unwrap();

        assert_eq!(stats.datagrams, 6);
        assert_eq!(stats.runt_datagrams, 1);
        assert_eq!(stats.rtp_discontinuities, 1);
        assert_eq!(stats.rtp_lost, 1);
        assert_eq!(
            collect(&consumer),
            vec![1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 5, 5, 5, 5, 6, 6, 6, 6]
        );
    }

    #[test]
    fn test_read_errors_do_not_stop_capture() {
        let running = AtomicBool::new(true);
        let (assembler, consumer) = assembler();
        let source = Scripted {
            reads: VecDeque::from(vec![
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")),
                Ok(vec![1, 2, 3]),
            ]),
            running: &running,
        };

        let stats = CaptureWorker::new(source, InputKind::Udp, true, assembler)
            .run(&running)
            .unwrap();

        assert_eq!(stats.read_errors, 1);
        assert_eq!(collect(&consumer), vec![1, 2, 3]);
    }

    /// Collects formatted log output for assertions
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_every_read_timeout_is_logged() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();

        let running = AtomicBool::new(true);
        let (assembler, _consumer) = assembler();
        let source = Scripted {
            reads: VecDeque::from(vec![
                Ok(vec![1]),
                Err(io::ErrorKind::WouldBlock.into()),
                Err(io::ErrorKind::TimedOut.into()),
                Ok(vec![2]),
            ]),
            running: &running,
        };

        let stats = tracing::subscriber::with_default(subscriber, || {
            CaptureWorker::new(source, InputKind::Udp, true, assembler)
                .run(&running)
                .unwrap()
        });

        let output = String::from_utf8(logs.0.lock().clone()).unwrap();
        // Two scripted timeouts plus the one that ends the script
        assert_eq!(stats.read_timeouts, 3);
        assert_eq!(output.matches("*** Input read timeout ***").count(), 3);
        assert_eq!(output.matches("Data received.").count(), 2);
    }
}
