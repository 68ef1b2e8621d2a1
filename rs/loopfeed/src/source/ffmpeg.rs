//! Decode a media file with FFmpeg and scale it to the device format.

use std::path::Path;

use ffmpeg_next as ffmpeg;
use ffmpeg::{format::Pixel, software::scaling};

use super::FrameSource;
use crate::{Error, FrameFormat, PixelFormat, Result};

fn decode_error(err: ffmpeg::Error) -> Error {
	Error::Decode(err.to_string())
}

/// Video frames decoded from the best video stream of a file.
pub struct FfmpegSource {
	input: ffmpeg::format::context::Input,
	stream: usize,
	decoder: ffmpeg::decoder::Video,

	// Recreated whenever the decoded frame geometry changes.
	scaler: Option<(Pixel, u32, u32, scaling::Context)>,

	format: FrameFormat,
	decoded: ffmpeg::frame::Video,
	scaled: ffmpeg::frame::Video,

	// Set once the demuxer ran out of packets and the decoder was flushed.
	eof: bool,
}

impl FfmpegSource {
	/// Open `path`, producing frames in `format`.
	pub fn open(path: impl AsRef<Path>, format: FrameFormat) -> Result<Self> {
		let path = path.as_ref();

		if format.frame_size() == 0 {
			return Err(Error::Format(format!("invalid frame size: {format}")));
		}

		// Idempotent
		ffmpeg::init().map_err(decode_error)?;

		let input = ffmpeg::format::input(path).map_err(decode_error)?;

		let (stream, parameters) = {
			let stream = input
				.streams()
				.best(ffmpeg::media::Type::Video)
				.ok_or_else(|| Error::Decode(format!("no video stream in {}", path.display())))?;
			(stream.index(), stream.parameters())
		};

		let context = ffmpeg::codec::context::Context::from_parameters(parameters).map_err(decode_error)?;
		let decoder = context.decoder().video().map_err(decode_error)?;

		tracing::info!(
			path = %path.display(),
			codec = ?decoder.id(),
			width = decoder.width(),
			height = decoder.height(),
			"opened input"
		);

		let target = match format.pixel {
			PixelFormat::Yuyv => Pixel::YUYV422,
		};

		Ok(Self {
			input,
			stream,
			decoder,
			scaler: None,
			format,
			decoded: ffmpeg::frame::Video::empty(),
			scaled: ffmpeg::frame::Video::new(target, format.width, format.height),
			eof: false,
		})
	}

	fn scale(&mut self) -> Result<()> {
		let (format, width, height) = (self.decoded.format(), self.decoded.width(), self.decoded.height());

		let stale = match &self.scaler {
			Some((f, w, h, _)) => (*f, *w, *h) != (format, width, height),
			None => true,
		};

		if stale {
			let context = scaling::Context::get(
				format,
				width,
				height,
				self.scaled.format(),
				self.format.width,
				self.format.height,
				scaling::Flags::BILINEAR,
			)
			.map_err(decode_error)?;

			tracing::debug!(?format, width, height, "created scaler");
			self.scaler = Some((format, width, height, context));
		}

		if let Some((_, _, _, scaler)) = self.scaler.as_mut() {
			scaler.run(&self.decoded, &mut self.scaled).map_err(decode_error)?;
		}

		Ok(())
	}
}

impl FrameSource for FfmpegSource {
	fn format(&self) -> FrameFormat {
		self.format
	}

	fn next_frame(&mut self) -> Result<bool> {
		loop {
			if self.decoder.receive_frame(&mut self.decoded).is_ok() {
				self.scale()?;
				return Ok(true);
			}

			if self.eof {
				return Ok(false);
			}

			let mut packet = ffmpeg::Packet::empty();
			match packet.read(&mut self.input) {
				Ok(()) if packet.stream() == self.stream => {
					self.decoder.send_packet(&packet).map_err(decode_error)?;
				}
				Ok(()) => continue,
				Err(ffmpeg::Error::Eof) => {
					// Drain any frames the decoder is still holding on to.
					self.decoder.send_eof().map_err(decode_error)?;
					self.eof = true;
				}
				Err(err) => return Err(decode_error(err)),
			}
		}
	}

	fn fill(&mut self, dst: &mut [u8]) -> Result<usize> {
		let size = self.format.frame_size();
		if dst.len() < size {
			return Err(Error::TooSmall {
				need: size,
				have: dst.len(),
			});
		}

		// FFmpeg may pad each row, while the device expects tightly packed rows.
		let row = self.format.stride();
		if row == 0 {
			return Ok(0);
		}

		let stride = self.scaled.stride(0);
		let data = self.scaled.data(0);

		for (y, out) in dst[..size].chunks_exact_mut(row).enumerate() {
			let start = y * stride;
			out.copy_from_slice(&data[start..start + row]);
		}

		Ok(size)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_empty_format() {
		// Checked before the file is touched.
		let res = FfmpegSource::open("/nonexistent/input.mp4", FrameFormat::new(0, 480));
		assert!(matches!(res, Err(Error::Format(_))));

		let res = FfmpegSource::open("/nonexistent/input.mp4", FrameFormat::new(640, 0));
		assert!(matches!(res, Err(Error::Format(_))));
	}

	#[test]
	fn missing_file() {
		let res = FfmpegSource::open("/nonexistent/input.mp4", FrameFormat::new(640, 480));
		assert!(matches!(res, Err(Error::Decode(_))));
	}
}
