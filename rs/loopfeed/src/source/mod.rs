//! Where raw frames come from.

mod pattern;

#[cfg(feature = "decode")]
mod ffmpeg;

pub use pattern::*;

#[cfg(feature = "decode")]
pub use ffmpeg::*;

use crate::{FrameFormat, Result};

/// A lazy, finite sequence of raw frames in a fixed format.
///
/// Decoding and filling are separate steps so the producer only holds a buffer while copying into it.
pub trait FrameSource {
	/// The layout of every frame, matching the device format exactly.
	fn format(&self) -> FrameFormat;

	/// Decode the next frame, returning `false` once the source is exhausted.
	fn next_frame(&mut self) -> Result<bool>;

	/// Write the most recently decoded frame into `dst`, returning the number of bytes used.
	fn fill(&mut self, dst: &mut [u8]) -> Result<usize>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
	fn format(&self) -> FrameFormat {
		(**self).format()
	}

	fn next_frame(&mut self) -> Result<bool> {
		(**self).next_frame()
	}

	fn fill(&mut self, dst: &mut [u8]) -> Result<usize> {
		(**self).fill(dst)
	}
}
