//! The streaming sink that owns buffer memory and reports completions.
//!
//! A [Device] is shared by the producer (which submits) and the consumer (which reclaims),
//! so every method takes `&self` and implementations serialize their own bookkeeping.

mod memory;

#[cfg(target_os = "linux")]
pub mod v4l2;

pub use memory::*;

use std::time::Duration;

use crate::{Region, Result};

/// Where a granted buffer lives in device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
	pub index: usize,
	pub offset: u64,
	pub len: usize,
}

/// The outcome of waiting for the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
	/// At least one completion can be reclaimed.
	Ready,
	TimedOut,
}

pub trait Device: Send + Sync {
	/// Ask for `count` buffers.
	///
	/// Fails with [crate::Error::InsufficientBuffers] if fewer are granted.
	fn negotiate(&self, count: usize) -> Result<Vec<RegionInfo>>;

	/// Map a granted buffer into process memory.
	fn map(&self, info: &RegionInfo) -> Result<Region>;

	/// Start the stream. Called once, before any submission.
	fn activate(&self) -> Result<()>;

	/// Stop the stream. Called once, after the last reclaim.
	fn deactivate(&self) -> Result<()>;

	/// Queue buffer `index` with `bytes_used` bytes of payload for transmission.
	///
	/// Must not block.
	fn submit(&self, index: usize, bytes_used: usize) -> Result<()>;

	/// Block until a completion is available, or until `timeout` if provided.
	fn wait_ready(&self, timeout: Option<Duration>) -> Result<Readiness>;

	/// Dequeue a completed buffer, returning `None` if nothing has completed.
	fn reclaim(&self) -> Result<Option<usize>>;
}

impl<D: Device + ?Sized> Device for &D {
	fn negotiate(&self, count: usize) -> Result<Vec<RegionInfo>> {
		(**self).negotiate(count)
	}

	fn map(&self, info: &RegionInfo) -> Result<Region> {
		(**self).map(info)
	}

	fn activate(&self) -> Result<()> {
		(**self).activate()
	}

	fn deactivate(&self) -> Result<()> {
		(**self).deactivate()
	}

	fn submit(&self, index: usize, bytes_used: usize) -> Result<()> {
		(**self).submit(index, bytes_used)
	}

	fn wait_ready(&self, timeout: Option<Duration>) -> Result<Readiness> {
		(**self).wait_ready(timeout)
	}

	fn reclaim(&self) -> Result<Option<usize>> {
		(**self).reclaim()
	}
}
