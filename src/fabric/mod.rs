//! Device-fabric substrate the collectives run on.
//!
//! Provides the pieces a peer-to-peer GPU group exposes to the collective
//! core:
//! - `DeviceBuffer`: aligned, zeroed, peer-visible device memory
//! - `DeviceTensor`: the dense bf16 vector reduced in place
//! - `Stream`: FIFO work queue with enqueue/synchronize semantics

pub mod memory;
pub mod stream;
pub mod tensor;

pub use memory::DeviceBuffer;
pub use stream::Stream;
pub use tensor::{DType, DeviceTensor};
