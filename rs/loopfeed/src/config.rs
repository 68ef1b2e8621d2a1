use std::time::Duration;

use crate::FrameFormat;

/// How buffers are negotiated, paced and drained.
#[derive(Clone, Debug, clap::Args, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
#[non_exhaustive]
pub struct PipelineConfig {
	/// The number of buffers to request from the device.
	///
	/// Startup fails if the device grants fewer.
	#[arg(id = "buffers", long = "buffers", default_value = "32", env = "LOOPFEED_BUFFERS")]
	pub buffers: usize,

	/// The minimum time between frames, or zero to stream as fast as the device allows.
	#[arg(
		id = "interval",
		long = "interval",
		default_value = "16666us",
		env = "LOOPFEED_INTERVAL",
		value_parser = humantime::parse_duration,
	)]
	#[serde(with = "humantime_serde")]
	pub interval: Duration,

	/// How long to wait for in-flight buffers once the source is exhausted.
	#[arg(
		id = "drain-timeout",
		long = "drain-timeout",
		default_value = "2s",
		env = "LOOPFEED_DRAIN_TIMEOUT",
		value_parser = humantime::parse_duration,
	)]
	#[serde(with = "humantime_serde")]
	pub drain_timeout: Duration,

	/// How long the consumer waits on the device before checking whether it should stop.
	#[arg(
		id = "ready-timeout",
		long = "ready-timeout",
		default_value = "100ms",
		env = "LOOPFEED_READY_TIMEOUT",
		value_parser = humantime::parse_duration,
	)]
	#[serde(with = "humantime_serde")]
	pub ready_timeout: Duration,

	/// Give up after this many consecutive device errors, or never if zero.
	#[arg(
		id = "max-device-errors",
		long = "max-device-errors",
		default_value = "16",
		env = "LOOPFEED_MAX_DEVICE_ERRORS"
	)]
	pub max_device_errors: u32,
}

impl Default for PipelineConfig {
	fn default() -> Self {
		Self {
			buffers: 32,
			interval: Duration::from_micros(16_666),
			drain_timeout: Duration::from_secs(2),
			ready_timeout: Duration::from_millis(100),
			max_device_errors: 16,
		}
	}
}

/// The frame size written to the device. Always YUYV.
#[derive(Clone, Debug, clap::Args, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
#[non_exhaustive]
pub struct FormatConfig {
	#[arg(id = "width", long = "width", default_value = "640", env = "LOOPFEED_WIDTH")]
	pub width: u32,

	#[arg(id = "height", long = "height", default_value = "480", env = "LOOPFEED_HEIGHT")]
	pub height: u32,
}

impl FormatConfig {
	pub fn format(&self) -> FrameFormat {
		FrameFormat::new(self.width, self.height)
	}
}

impl Default for FormatConfig {
	fn default() -> Self {
		Self {
			width: 640,
			height: 480,
		}
	}
}
