//! Recorder
//!
//! Wires the capture loop and the writer thread together through the transfer
//! queue, and runs them until the shared running flag is cleared.

use std::sync::atomic::AtomicBool;
use std::time::Instant;

use crate::buffer::{create_shared_pool, transfer_queue};
use crate::capture::{CaptureStats, CaptureWorker, DatagramSource, StreamAssembler, UdpSource};
use crate::config::{AppConfig, InputUrl};
use crate::error::Result;
use crate::storage::{FileRotator, RotationConfig, WriterHandle, WriterStats};

/// Summary of a finished recording
#[derive(Debug, Clone, Default)]
pub struct RecorderStats {
    pub capture: CaptureStats,
    pub writer: WriterStats,
    pub overflow_packets: u64,
    pub duration_secs: f64,
}

/// A validated recorder ready to run
pub struct Recorder {
    config: AppConfig,
    input: InputUrl,
}

impl Recorder {
    /// Validate the configuration. Any error here is fatal.
    pub fn new(config: AppConfig) -> Result<Self> {
        let input = config.validate()?;
        Ok(Self { config, input })
    }

    /// Connect the configured input and record until `running` is cleared
    pub fn run(&self, running: &AtomicBool) -> Result<RecorderStats> {
        let source = UdpSource::connect(
            &self.input,
            self.config.input.family,
            self.config.input.read_timeout(),
            self.config.input.recv_buffer_size,
        )?;
        self.run_with_source(source, running)
    }

    /// Record from an already connected source
    pub fn run_with_source<S: DatagramSource>(
        &self,
        source: S,
        running: &AtomicBool,
    ) -> Result<RecorderStats> {
        let started = Instant::now();
        let buffer = &self.config.buffer;
        let pool = create_shared_pool(buffer.pool_slots, buffer.packet_capacity);
        let (producer, consumer) = transfer_queue();

        let rotator = FileRotator::new(self.rotation_config()?);
        let writer = WriterHandle::spawn(consumer, rotator, pool.clone())?;

        let capture = StreamAssembler::new(pool.clone(), producer, buffer.max_fill_time())
            .and_then(|assembler| {
                CaptureWorker::new(
                    source,
                    self.input.kind,
                    self.config.input.report_discontinuity,
                    assembler,
                )
                .run(running)
            });

        // On failure the producer is already dropped, so the writer drains what it has and exits.
        let writer_stats = writer.join();
        let capture = capture?;

        Ok(RecorderStats {
            capture,
            writer: writer_stats,
            overflow_packets: pool.overflow_total(),
            duration_secs: started.elapsed().as_secs_f64(),
        })
    }

    fn rotation_config(&self) -> Result<RotationConfig> {
        Ok(RotationConfig {
            base_dir: self.config.output.dir.clone(),
            prefix: self.config.prefix()?.to_string(),
            rotate_secs: self.config.output.rotate_secs,
            create_dirs: self.config.output.create_dirs,
        })
    }

    pub fn input(&self) -> &InputUrl {
        &self.input
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}
