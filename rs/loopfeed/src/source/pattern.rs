use super::FrameSource;
use crate::{Error, FrameFormat, Result};

// SMPTE-ish colour bars as limited range BT.601 (Y, U, V).
const BARS: [[u8; 3]; 8] = [
	[235, 128, 128], // white
	[210, 16, 146],  // yellow
	[170, 166, 16],  // cyan
	[145, 54, 34],   // green
	[106, 202, 222], // magenta
	[81, 90, 240],   // red
	[41, 240, 110],  // blue
	[16, 128, 128],  // black
];

/// Colour bars that scroll one pixel per frame, generated directly into the buffer.
#[derive(Debug, Clone)]
pub struct PatternSource {
	format: FrameFormat,
	limit: Option<u64>,
	frame: u64,
	row: Vec<u8>,
}

impl PatternSource {
	/// Produce `limit` frames, or forever if `None`.
	pub fn new(format: FrameFormat, limit: Option<u64>) -> Self {
		Self {
			format,
			limit,
			frame: 0,
			row: vec![0; format.stride()],
		}
	}

	/// The number of frames decoded so far.
	pub fn frames(&self) -> u64 {
		self.frame
	}

	fn render_row(&mut self) {
		let width = self.format.width as u64;
		let bar_width = (width / BARS.len() as u64).max(1);
		let shift = self.frame.saturating_sub(1);

		let color = |x: u64| BARS[(((x + shift) % width.max(1)) / bar_width).min(BARS.len() as u64 - 1) as usize];

		for (pair, chunk) in self.row.chunks_mut(4).enumerate() {
			let x = pair as u64 * 2;
			let [y0, u, v] = color(x);
			let [y1, _, _] = color(x + 1);

			let pixels = [y0, u, y1, v];
			chunk.copy_from_slice(&pixels[..chunk.len()]);
		}
	}
}

impl FrameSource for PatternSource {
	fn format(&self) -> FrameFormat {
		self.format
	}

	fn next_frame(&mut self) -> Result<bool> {
		if self.limit.is_some_and(|limit| self.frame >= limit) {
			return Ok(false);
		}

		self.frame += 1;
		Ok(true)
	}

	fn fill(&mut self, dst: &mut [u8]) -> Result<usize> {
		let size = self.format.frame_size();
		if dst.len() < size {
			return Err(Error::TooSmall {
				need: size,
				have: dst.len(),
			});
		}

		self.render_row();

		let stride = self.format.stride();
		if stride > 0 {
			for row in dst[..size].chunks_exact_mut(stride) {
				row.copy_from_slice(&self.row);
			}
		}

		Ok(size)
	}
}
