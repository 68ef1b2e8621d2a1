use std::{ffi::OsString, fs, path::PathBuf};

use anyhow::Context;
use clap::{CommandFactory, FromArgMatches, Parser};

use loopfeed::{
	FormatConfig, Pipeline, PipelineConfig,
	device::{Device, MemoryDevice},
	source::{FrameSource, PatternSource},
};

#[derive(Parser, Clone, Debug, serde::Serialize, serde::Deserialize)]
#[command(version, about)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
	/// Load settings from a TOML file. Flags and environment variables take precedence.
	#[serde(skip)]
	pub file: Option<PathBuf>,

	/// The log configuration.
	#[command(flatten)]
	pub log: loopfeed::Log,

	/// The V4L2 output device, usually created by v4l2loopback.
	#[arg(long, default_value = "/dev/video10", env = "LOOPFEED_DEVICE")]
	pub device: PathBuf,

	/// Decode this media file instead of streaming a test pattern.
	#[arg(long, env = "LOOPFEED_INPUT")]
	#[serde(skip_serializing_if = "Option::is_none")]
	pub input: Option<PathBuf>,

	/// Stop after this many frames.
	#[arg(long, env = "LOOPFEED_FRAMES")]
	#[serde(skip_serializing_if = "Option::is_none")]
	pub frames: Option<u64>,

	#[command(flatten)]
	pub format: FormatConfig,

	#[command(flatten)]
	pub pipeline: PipelineConfig,

	/// Print what the device supports and exit.
	#[arg(long)]
	#[serde(skip)]
	pub capabilities: bool,

	/// Stream into an in-memory device instead of real hardware.
	#[arg(long)]
	#[serde(skip)]
	pub simulate: bool,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			file: None,
			log: Default::default(),
			device: "/dev/video10".into(),
			input: None,
			frames: None,
			format: Default::default(),
			pipeline: Default::default(),
			capabilities: false,
			simulate: false,
		}
	}
}

impl Config {
	/// Parse the command line, layered on top of the config file if one is given.
	pub fn load_from<I, T>(args: I) -> anyhow::Result<Self>
	where
		I: IntoIterator<Item = T> + Clone,
		T: Into<OsString> + Clone,
	{
		let config = Self::try_parse_from(args.clone())?;
		let Some(path) = config.file.clone() else {
			return Ok(config);
		};

		let contents = fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
		let mut file: Self = toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))?;

		// Without defaults, only arguments that were actually provided override the file.
		let matches = Self::command()
			.mut_args(|arg| arg.default_value(None))
			.try_get_matches_from(args)?;
		file.update_from_arg_matches(&matches)?;

		Ok(file)
	}
}

fn main() -> anyhow::Result<()> {
	let config = Config::load_from(std::env::args_os().collect::<Vec<_>>())?;
	config.log.init();

	if config.simulate {
		let format = config.format.format();
		let device = MemoryDevice::new(config.pipeline.buffers, format.frame_size());
		return stream(&config, device);
	}

	hardware(&config)
}

#[cfg(target_os = "linux")]
fn hardware(config: &Config) -> anyhow::Result<()> {
	use loopfeed::device::v4l2::{Memory, V4l2Device};

	let device = V4l2Device::open(&config.device).with_context(|| format!("failed to open {}", config.device.display()))?;
	let caps = device.capabilities().context("failed to query capabilities")?;

	if config.capabilities {
		println!("{}", config.device.display());
		print!("{caps}");
		for memory in Memory::ALL {
			let supported = if device.supports(memory) { "yes" } else { "no" };
			println!("  {memory}: {supported}");
		}
		return Ok(());
	}

	caps.require_streaming_output()?;
	tracing::info!(device = %config.device.display(), card = %caps.card, driver = %caps.driver, "opened device");

	let format = device
		.set_format(&config.format.format())
		.context("failed to set format")?;
	tracing::info!(%format, "set format");

	stream(config, device)
}

#[cfg(not(target_os = "linux"))]
fn hardware(_config: &Config) -> anyhow::Result<()> {
	anyhow::bail!("V4L2 devices are only available on Linux, use --simulate instead")
}

fn stream<D: Device>(config: &Config, device: D) -> anyhow::Result<()> {
	let source = source(config)?;

	let pipeline = Pipeline::new(device, &config.pipeline).context("failed to set up buffers")?;
	let report = pipeline.run(source).context("stream failed")?;

	println!("{report}");
	Ok(())
}

fn source(config: &Config) -> anyhow::Result<Box<dyn FrameSource + Send>> {
	let format = config.format.format();

	match &config.input {
		#[cfg(feature = "decode")]
		Some(path) => {
			let source = loopfeed::source::FfmpegSource::open(path, format)
				.with_context(|| format!("failed to open {}", path.display()))?;

			Ok(match config.frames {
				Some(limit) => Box::new(Limit::new(source, limit)),
				None => Box::new(source),
			})
		}
		#[cfg(not(feature = "decode"))]
		Some(_) => anyhow::bail!("decoding files requires the `decode` feature"),
		None => Ok(Box::new(PatternSource::new(format, config.frames))),
	}
}

/// Stop a source after a fixed number of frames.
#[cfg(feature = "decode")]
struct Limit<S> {
	inner: S,
	remaining: u64,
}

#[cfg(feature = "decode")]
impl<S> Limit<S> {
	fn new(inner: S, remaining: u64) -> Self {
		Self { inner, remaining }
	}
}

#[cfg(feature = "decode")]
impl<S: FrameSource> FrameSource for Limit<S> {
	fn format(&self) -> loopfeed::FrameFormat {
		self.inner.format()
	}

	fn next_frame(&mut self) -> loopfeed::Result<bool> {
		if self.remaining == 0 {
			return Ok(false);
		}

		self.remaining -= 1;
		self.inner.next_frame()
	}

	fn fill(&mut self, dst: &mut [u8]) -> loopfeed::Result<usize> {
		self.inner.fill(dst)
	}
}
