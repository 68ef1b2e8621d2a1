//! # loopfeed: stream raw video into an output device
//!
//! `loopfeed` moves frames from a [source::FrameSource] into a streaming output [device::Device],
//! such as a V4L2 loopback node, through a fixed pool of device buffers.
//!
//! ## API
//!
//! Every buffer in the [BufferPool] is owned by exactly one party at a time:
//! - The pool, while it is [SlotState::Free].
//! - The producer, while it is [SlotState::Claimed] and being filled.
//! - The device, while it is [SlotState::Submitted] and being transmitted.
//!
//! A [Pipeline] wires everything together:
//! - [Pipeline::new] negotiates and maps the buffers, failing if the device grants too few.
//! - [Pipeline::run] starts a producer thread that claims, fills and submits buffers,
//!   and a consumer thread that waits for the device to finish with them and frees them again.
//!
//! The producer only ever blocks when every buffer is in flight, so the pool size is the only backpressure.
//! Once the source is exhausted the pipeline waits for in-flight buffers up to [PipelineConfig::drain_timeout],
//! then stops both threads and reports what happened in a [Report].
//!
//! Use [device::MemoryDevice] to run without hardware.

mod config;
mod consumer;
mod error;
mod format;
mod log;
mod pipeline;
mod pool;
mod producer;
mod region;
mod throttle;

pub mod device;
pub mod source;

pub use config::*;
pub use consumer::ConsumerStats;
pub use error::*;
pub use format::*;
pub use log::*;
pub use pipeline::*;
pub use pool::*;
pub use producer::ProducerStats;
pub use region::*;
