//! Writer thread
//!
//! Drains the transfer queue into the file rotator and returns packets to the
//! pool. Runs until the shutdown sentinel arrives, then closes the open file.

use chrono::TimeZone;
use std::fmt;
use std::io;
use std::thread::{self, JoinHandle};

use crate::buffer::{QueueConsumer, SharedPacketPool};
use crate::storage::rotation::{FileRotator, RotationStats};

/// Counters reported when the writer exits
#[derive(Debug, Clone, Default)]
pub struct WriterStats {
    pub packets_written: u64,
    pub empty_packets: u64,
    pub max_queue_depth: usize,
    pub rotation: RotationStats,
}

/// Handle to a running writer thread
pub struct WriterHandle {
    handle: JoinHandle<WriterStats>,
}

impl WriterHandle {
    /// Spawn the writer thread
    pub fn spawn<Tz>(
        consumer: QueueConsumer,
        rotator: FileRotator<Tz>,
        pool: SharedPacketPool,
    ) -> io::Result<Self>
    where
        Tz: TimeZone + Send + 'static,
        Tz::Offset: fmt::Display,
    {
        let handle = thread::Builder::new()
            .name("ts-writer".into())
            .spawn(move || drain(consumer, rotator, pool))?;

        Ok(Self { handle })
    }

    /// Wait for the writer to drain the queue and exit
    pub fn join(self) -> WriterStats {
        match self.handle.join() {
            Ok(stats) => stats,
            Err(_) => {
                tracing::error!("Writer thread panicked");
                WriterStats::default()
            }
        }
    }
}

/// Consume packets until the sentinel, writing each one through the rotator
pub fn drain<Tz>(
    consumer: QueueConsumer,
    mut rotator: FileRotator<Tz>,
    pool: SharedPacketPool,
) -> WriterStats
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    let mut stats = WriterStats::default();

    while let Some(packet) = consumer.pop() {
        if packet.is_empty() {
            stats.empty_packets += 1;
            pool.release(packet);
            continue;
        }

        let depth = consumer.depth();
        stats.max_queue_depth = stats.max_queue_depth.max(depth);
        tracing::debug!(
            num = packet.id(),
            size = packet.len(),
            packet_time = packet.epoch_secs().unwrap_or_default(),
            depth,
            " - Got packet"
        );

        rotator.write_packet(&packet, depth);
        stats.packets_written += 1;
        pool.release(packet);
    }

    rotator.finish();
    stats.rotation = rotator.stats().clone();
    tracing::debug!("Writer finished: {:?}", stats);
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{create_shared_pool, transfer_queue};
    use crate::storage::rotation::RotationConfig;
    use chrono::Utc;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::tempdir;

    #[test]
    fn test_writer_drains_and_releases() {
        let dir = tempdir().unwrap();
        let pool = create_shared_pool(4, 64);
        let (producer, consumer) = transfer_queue();
        let rotator = FileRotator::with_timezone(
            RotationConfig {
                base_dir: dir.path().to_path_buf(),
                prefix: "w".into(),
                rotate_secs: 60,
                create_dirs: false,
            },
            Utc,
        );

        let writer = WriterHandle::spawn(consumer, rotator, pool.clone()).unwrap();

        let start = UNIX_EPOCH + Duration::from_secs(1_699_999_980);
        for chunk in [&b"abc"[..], &b"def"[..]] {
            let mut packet = pool.acquire().unwrap();
            packet.append(chunk);
            packet.mark_started(start);
            producer.push(packet).unwrap();
        }
        // Empty packets are skipped by the writer
        producer.push(pool.acquire().unwrap()).unwrap();
        producer.push_shutdown();

        let stats = writer.join();
        assert_eq!(stats.packets_written, 2);
        assert_eq!(stats.empty_packets, 1);
        assert_eq!(stats.rotation.files_created, 1);
        assert_eq!(stats.rotation.bytes_written, 6);
        assert_eq!(pool.slots_in_use(), 0);

        let written = std::fs::read(dir.path().join("w-20231114_221300-1699999980.ts")).unwrap();
        assert_eq!(written, b"abcdef");
    }
}
