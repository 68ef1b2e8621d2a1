use std::io;

use crate::SlotState;

/// A list of possible errors that can occur while streaming.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
	/// The device granted fewer buffers than requested.
	#[error("insufficient buffers: requested={requested} granted={granted}")]
	InsufficientBuffers { requested: usize, granted: usize },

	/// A pool needs at least one slot.
	#[error("empty buffer pool")]
	EmptyPool,

	/// A device buffer could not be mapped into memory.
	#[error("failed to map buffer {index}: {source}")]
	Map {
		index: usize,
		#[source]
		source: io::Error,
	},

	/// The device can't be used for streaming output.
	#[error("unsupported device: {0}")]
	Unsupported(String),

	/// The device rejected or adjusted the requested format.
	#[error("format rejected: {0}")]
	Format(String),

	/// The device has no room for another submission right now.
	#[error("device busy")]
	DeviceBusy,

	#[error("device error: {0}")]
	Device(#[from] io::Error),

	#[error("invalid slot index: {0}")]
	InvalidIndex(usize),

	/// A state transition that would break the slot lifecycle.
	#[error("slot {index} is {actual}, expected {expected}")]
	InvalidState {
		index: usize,
		actual: SlotState,
		expected: SlotState,
	},

	/// The frame doesn't fit into the buffer.
	#[error("buffer too small: need={need} have={have}")]
	TooSmall { need: usize, have: usize },

	/// The pool was closed while waiting.
	#[error("closed")]
	Closed,

	#[error("too many consecutive device errors: {0}")]
	TooManyErrors(u32),

	#[error("decode error: {0}")]
	Decode(String),

	#[error("failed to spawn thread: {0}")]
	Spawn(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Counts consecutive failures and gives up once the limit is reached.
///
/// A limit of zero never gives up.
#[derive(Debug)]
pub(crate) struct Strikes {
	limit: u32,
	count: u32,
}

impl Strikes {
	pub fn new(limit: u32) -> Self {
		Self { limit, count: 0 }
	}

	pub fn reset(&mut self) {
		self.count = 0;
	}

	pub fn strike(&mut self) -> Result<()> {
		self.count = self.count.saturating_add(1);
		if self.limit > 0 && self.count >= self.limit {
			return Err(Error::TooManyErrors(self.count));
		}

		Ok(())
	}
}
