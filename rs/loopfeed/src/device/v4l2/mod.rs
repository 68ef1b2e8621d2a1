//! A V4L2 video output node (ex. v4l2loopback) using MMAP streaming I/O.

mod sys;

use std::{
	fmt, fs, io,
	os::{
		fd::{AsFd, AsRawFd, OwnedFd},
		unix::fs::OpenOptionsExt,
	},
	path::{Path, PathBuf},
	time::Duration,
};

use super::{Device, Readiness, RegionInfo};
use crate::{Error, FrameFormat, PixelFormat, Region, Result};

/// What the driver reports via `VIDIOC_QUERYCAP`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
	pub driver: String,
	pub card: String,
	pub bus_info: String,
	pub version: u32,
	/// Capabilities of the physical device as a whole.
	pub capabilities: u32,
	/// Capabilities of this particular node.
	pub device_caps: u32,
}

const CAPABILITY_NAMES: &[(u32, &str)] = &[
	(sys::CAP_VIDEO_CAPTURE, "VIDEO_CAPTURE"),
	(sys::CAP_VIDEO_OUTPUT, "VIDEO_OUTPUT"),
	(sys::CAP_VIDEO_OVERLAY, "VIDEO_OVERLAY"),
	(sys::CAP_VBI_CAPTURE, "VBI_CAPTURE"),
	(sys::CAP_VBI_OUTPUT, "VBI_OUTPUT"),
	(sys::CAP_SLICED_VBI_CAPTURE, "SLICED_VBI_CAPTURE"),
	(sys::CAP_SLICED_VBI_OUTPUT, "SLICED_VBI_OUTPUT"),
	(sys::CAP_RDS_CAPTURE, "RDS_CAPTURE"),
	(sys::CAP_VIDEO_OUTPUT_OVERLAY, "VIDEO_OUTPUT_OVERLAY"),
	(sys::CAP_TUNER, "TUNER"),
	(sys::CAP_AUDIO, "AUDIO"),
	(sys::CAP_RADIO, "RADIO"),
	(sys::CAP_MODULATOR, "MODULATOR"),
	(sys::CAP_EXT_PIX_FORMAT, "EXT_PIX_FORMAT"),
	(sys::CAP_READWRITE, "READWRITE"),
	(sys::CAP_ASYNCIO, "ASYNCIO"),
	(sys::CAP_STREAMING, "STREAMING"),
	(sys::CAP_DEVICE_CAPS, "DEVICE_CAPS"),
];

impl Capabilities {
	/// The capabilities that apply to this node.
	pub fn effective(&self) -> u32 {
		if self.capabilities & sys::CAP_DEVICE_CAPS != 0 {
			self.device_caps
		} else {
			self.capabilities
		}
	}

	/// The names of every flag set on this node.
	pub fn names(&self) -> Vec<&'static str> {
		let caps = self.effective();
		CAPABILITY_NAMES
			.iter()
			.filter(|(flag, _)| caps & flag != 0)
			.map(|(_, name)| *name)
			.collect()
	}

	pub fn is_output(&self) -> bool {
		self.effective() & sys::CAP_VIDEO_OUTPUT != 0
	}

	pub fn is_streaming(&self) -> bool {
		self.effective() & sys::CAP_STREAMING != 0
	}

	pub fn is_readwrite(&self) -> bool {
		self.effective() & sys::CAP_READWRITE != 0
	}

	/// Fail unless this node can be used for MMAP streaming output.
	pub fn require_streaming_output(&self) -> Result<()> {
		if !self.is_output() {
			return Err(Error::Unsupported(format!("{} is not a video output device", self.card)));
		}

		if !self.is_streaming() {
			return Err(Error::Unsupported(format!("{} does not support streaming I/O", self.card)));
		}

		Ok(())
	}
}

impl fmt::Display for Capabilities {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		writeln!(f, "Driver:      {}", self.driver)?;
		writeln!(f, "Card:        {}", self.card)?;
		writeln!(f, "Bus info:    {}", self.bus_info)?;
		writeln!(
			f,
			"Version:     {}.{}.{}",
			(self.version >> 16) & 0xff,
			(self.version >> 8) & 0xff,
			self.version & 0xff
		)?;
		writeln!(f, "Capabilities: 0x{:08x}", self.effective())?;
		for name in self.names() {
			writeln!(f, "  - {name}")?;
		}
		Ok(())
	}
}

/// Memory types a node may support for streaming I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Memory {
	Mmap,
	UserPtr,
	DmaBuf,
}

impl Memory {
	pub const ALL: [Memory; 3] = [Memory::Mmap, Memory::UserPtr, Memory::DmaBuf];

	fn raw(self) -> u32 {
		match self {
			Self::Mmap => sys::MEMORY_MMAP,
			Self::UserPtr => sys::MEMORY_USERPTR,
			Self::DmaBuf => sys::MEMORY_DMABUF,
		}
	}
}

impl fmt::Display for Memory {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Mmap => write!(f, "MMAP"),
			Self::UserPtr => write!(f, "USERPTR"),
			Self::DmaBuf => write!(f, "DMABUF"),
		}
	}
}

/// An open V4L2 output node.
pub struct V4l2Device {
	fd: OwnedFd,
	path: PathBuf,
}

impl V4l2Device {
	/// Open the node in non-blocking mode; readiness is waited on with `poll`.
	pub fn open(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref().to_path_buf();
		let file = fs::OpenOptions::new()
			.read(true)
			.write(true)
			.custom_flags(libc::O_NONBLOCK)
			.open(&path)?;

		tracing::debug!(path = %path.display(), "opened device");

		Ok(Self { fd: file.into(), path })
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn capabilities(&self) -> Result<Capabilities> {
		// SAFETY: All-zero is a valid value for this plain C struct.
		let mut cap: sys::v4l2_capability = unsafe { std::mem::zeroed() };
		unsafe { sys::ioctl(self.fd.as_raw_fd(), sys::VIDIOC_QUERYCAP, &mut cap) }?;

		Ok(Capabilities {
			driver: sys::c_str(&cap.driver),
			card: sys::c_str(&cap.card),
			bus_info: sys::c_str(&cap.bus_info),
			version: cap.version,
			capabilities: cap.capabilities,
			device_caps: cap.device_caps,
		})
	}

	/// Check whether streaming with the given memory type is supported.
	///
	/// Requests a single buffer and frees it again, so this must not be called while streaming.
	pub fn supports(&self, memory: Memory) -> bool {
		let mut req = sys::v4l2_requestbuffers {
			count: 1,
			type_: sys::BUF_TYPE_VIDEO_OUTPUT,
			memory: memory.raw(),
			..Default::default()
		};

		let supported = unsafe { sys::ioctl(self.fd.as_raw_fd(), sys::VIDIOC_REQBUFS, &mut req) }.is_ok() && req.count > 0;

		req.count = 0;
		let _ = unsafe { sys::ioctl(self.fd.as_raw_fd(), sys::VIDIOC_REQBUFS, &mut req) };

		supported
	}

	/// Set the output format, returning what the driver accepted.
	///
	/// Fails if the driver changed the resolution or pixel format, since frames are produced for exactly `format`.
	pub fn set_format(&self, format: &FrameFormat) -> Result<FrameFormat> {
		let pix = sys::v4l2_pix_format {
			width: format.width,
			height: format.height,
			pixelformat: format.pixel.fourcc(),
			field: sys::FIELD_NONE,
			..Default::default()
		};

		let mut fmt = sys::v4l2_format {
			type_: sys::BUF_TYPE_VIDEO_OUTPUT,
			fmt: sys::v4l2_format_union { pix },
		};

		unsafe { sys::ioctl(self.fd.as_raw_fd(), sys::VIDIOC_S_FMT, &mut fmt) }?;

		// SAFETY: The driver fills in `pix` for video output buffers.
		let pix = unsafe { fmt.fmt.pix };
		let pixel = PixelFormat::from_fourcc(pix.pixelformat)
			.ok_or_else(|| Error::Format(format!("unknown pixel format 0x{:08x}", pix.pixelformat)))?;

		let accepted = FrameFormat {
			width: pix.width,
			height: pix.height,
			pixel,
		};

		if accepted != *format {
			return Err(Error::Format(format!("requested {format}, driver chose {accepted}")));
		}

		tracing::info!(format = %accepted, size = pix.sizeimage, "set output format");
		Ok(accepted)
	}

	fn stream(&self, request: u32) -> io::Result<()> {
		let mut type_: libc::c_int = sys::BUF_TYPE_VIDEO_OUTPUT as libc::c_int;
		unsafe { sys::ioctl(self.fd.as_raw_fd(), request, &mut type_) }
	}

	fn release_buffers(&self) -> io::Result<()> {
		let mut req = sys::v4l2_requestbuffers {
			count: 0,
			type_: sys::BUF_TYPE_VIDEO_OUTPUT,
			memory: sys::MEMORY_MMAP,
			..Default::default()
		};
		unsafe { sys::ioctl(self.fd.as_raw_fd(), sys::VIDIOC_REQBUFS, &mut req) }
	}
}

impl Device for V4l2Device {
	fn negotiate(&self, count: usize) -> Result<Vec<RegionInfo>> {
		let mut req = sys::v4l2_requestbuffers {
			count: u32::try_from(count).map_err(|_| Error::InvalidIndex(count))?,
			type_: sys::BUF_TYPE_VIDEO_OUTPUT,
			memory: sys::MEMORY_MMAP,
			..Default::default()
		};
		unsafe { sys::ioctl(self.fd.as_raw_fd(), sys::VIDIOC_REQBUFS, &mut req) }?;

		let granted = req.count as usize;
		tracing::debug!(requested = count, granted, "requested buffers");

		if granted < count {
			return Err(Error::InsufficientBuffers {
				requested: count,
				granted,
			});
		}

		(0..granted)
			.map(|index| -> Result<RegionInfo> {
				let mut buf = sys::v4l2_buffer::output_mmap(index as u32);
				unsafe { sys::ioctl(self.fd.as_raw_fd(), sys::VIDIOC_QUERYBUF, &mut buf) }?;

				Ok(RegionInfo {
					index,
					// SAFETY: The driver fills in `offset` for MMAP buffers.
					offset: unsafe { buf.m.offset } as u64,
					len: buf.length as usize,
				})
			})
			.collect()
	}

	fn map(&self, info: &RegionInfo) -> Result<Region> {
		Region::map(self.fd.as_fd(), info.offset, info.len).map_err(|source| Error::Map {
			index: info.index,
			source,
		})
	}

	fn activate(&self) -> Result<()> {
		self.stream(sys::VIDIOC_STREAMON)?;
		tracing::info!(path = %self.path.display(), "stream on");
		Ok(())
	}

	fn deactivate(&self) -> Result<()> {
		self.stream(sys::VIDIOC_STREAMOFF)?;
		tracing::info!(path = %self.path.display(), "stream off");
		Ok(())
	}

	fn submit(&self, index: usize, bytes_used: usize) -> Result<()> {
		let mut buf = sys::v4l2_buffer::output_mmap(index as u32);
		buf.bytesused = u32::try_from(bytes_used).map_err(|_| Error::TooSmall {
			need: bytes_used,
			have: u32::MAX as usize,
		})?;
		buf.field = sys::FIELD_NONE;

		match unsafe { sys::ioctl(self.fd.as_raw_fd(), sys::VIDIOC_QBUF, &mut buf) } {
			Ok(()) => Ok(()),
			Err(err) if is_busy(&err) => Err(Error::DeviceBusy),
			Err(err) => Err(err.into()),
		}
	}

	fn wait_ready(&self, timeout: Option<Duration>) -> Result<Readiness> {
		let mut pfd = libc::pollfd {
			fd: self.fd.as_raw_fd(),
			events: libc::POLLOUT,
			revents: 0,
		};

		let timeout = match timeout {
			Some(timeout) => libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX),
			None => -1,
		};

		match unsafe { libc::poll(&mut pfd, 1, timeout) } {
			0 => Ok(Readiness::TimedOut),
			n if n > 0 => {
				if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
					return Err(io::Error::other(format!("poll revents=0x{:x}", pfd.revents)).into());
				}
				Ok(Readiness::Ready)
			}
			_ => {
				let err = io::Error::last_os_error();
				if err.kind() == io::ErrorKind::Interrupted {
					return Ok(Readiness::TimedOut);
				}
				Err(err.into())
			}
		}
	}

	fn reclaim(&self) -> Result<Option<usize>> {
		let mut buf = sys::v4l2_buffer::output_mmap(0);

		match unsafe { sys::ioctl(self.fd.as_raw_fd(), sys::VIDIOC_DQBUF, &mut buf) } {
			Ok(()) => Ok(Some(buf.index as usize)),
			Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
			Err(err) => Err(err.into()),
		}
	}
}

impl fmt::Debug for V4l2Device {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("V4l2Device").field("path", &self.path).finish()
	}
}

impl Drop for V4l2Device {
	fn drop(&mut self) {
		// Fails harmlessly if buffers were never requested.
		if let Err(err) = self.release_buffers() {
			tracing::debug!(%err, "failed to release buffers");
		}
	}
}

fn is_busy(err: &io::Error) -> bool {
	err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EBUSY)
}
