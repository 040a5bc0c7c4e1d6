//! Output files: naming, rotation and the writer thread

pub mod naming;
pub mod rotation;
pub mod writer;

pub use naming::OutputNames;
pub use rotation::{FileRotator, RotationConfig, RotationStats};
pub use writer::{WriterHandle, WriterStats};
