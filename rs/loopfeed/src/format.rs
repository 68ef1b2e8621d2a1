use std::fmt;

/// Pixel layout of a raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
	/// YUV 4:2:2 packed as Y0 U Y1 V, two bytes per pixel.
	#[default]
	Yuyv,
}

impl PixelFormat {
	/// The V4L2 fourcc code.
	pub fn fourcc(self) -> u32 {
		match self {
			Self::Yuyv => u32::from_le_bytes(*b"YUYV"),
		}
	}

	pub fn from_fourcc(code: u32) -> Option<Self> {
		match &code.to_le_bytes() {
			b"YUYV" => Some(Self::Yuyv),
			_ => None,
		}
	}

	pub fn bytes_per_pixel(self) -> usize {
		match self {
			Self::Yuyv => 2,
		}
	}
}

impl fmt::Display for PixelFormat {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Yuyv => write!(f, "YUYV"),
		}
	}
}

/// The negotiated layout of every frame written to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
	pub width: u32,
	pub height: u32,
	pub pixel: PixelFormat,
}

impl FrameFormat {
	pub fn new(width: u32, height: u32) -> Self {
		Self {
			width,
			height,
			pixel: PixelFormat::Yuyv,
		}
	}

	/// Bytes between the start of two rows, without padding.
	pub fn stride(&self) -> usize {
		self.width as usize * self.pixel.bytes_per_pixel()
	}

	/// The number of bytes in a single frame.
	pub fn frame_size(&self) -> usize {
		self.stride() * self.height as usize
	}
}

impl fmt::Display for FrameFormat {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}x{} {}", self.width, self.height, self.pixel)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn yuyv_fourcc() {
		// v4l2_fourcc('Y', 'U', 'Y', 'V')
		assert_eq!(PixelFormat::Yuyv.fourcc(), 0x5659_5559);
		assert_eq!(PixelFormat::from_fourcc(0x5659_5559), Some(PixelFormat::Yuyv));
		assert_eq!(PixelFormat::from_fourcc(0), None);
	}

	#[test]
	fn frame_size() {
		let format = FrameFormat::new(640, 480);
		assert_eq!(format.stride(), 1280);
		assert_eq!(format.frame_size(), 614_400);
		assert_eq!(format.to_string(), "640x480 YUYV");
	}
}
