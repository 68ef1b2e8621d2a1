//! The subset of `linux/videodev2.h` needed for MMAP streaming output.
#![allow(non_camel_case_types, dead_code)]

use std::{io, mem, os::fd::RawFd};

pub const BUF_TYPE_VIDEO_OUTPUT: u32 = 2;
pub const MEMORY_MMAP: u32 = 1;
pub const MEMORY_USERPTR: u32 = 2;
pub const MEMORY_DMABUF: u32 = 4;
pub const FIELD_NONE: u32 = 1;

pub const CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
pub const CAP_VIDEO_OUTPUT: u32 = 0x0000_0002;
pub const CAP_VIDEO_OVERLAY: u32 = 0x0000_0004;
pub const CAP_VBI_CAPTURE: u32 = 0x0000_0010;
pub const CAP_VBI_OUTPUT: u32 = 0x0000_0020;
pub const CAP_SLICED_VBI_CAPTURE: u32 = 0x0000_0040;
pub const CAP_SLICED_VBI_OUTPUT: u32 = 0x0000_0080;
pub const CAP_RDS_CAPTURE: u32 = 0x0000_0100;
pub const CAP_VIDEO_OUTPUT_OVERLAY: u32 = 0x0000_0200;
pub const CAP_TUNER: u32 = 0x0001_0000;
pub const CAP_AUDIO: u32 = 0x0002_0000;
pub const CAP_RADIO: u32 = 0x0004_0000;
pub const CAP_MODULATOR: u32 = 0x0008_0000;
pub const CAP_EXT_PIX_FORMAT: u32 = 0x0020_0000;
pub const CAP_READWRITE: u32 = 0x0100_0000;
pub const CAP_ASYNCIO: u32 = 0x0200_0000;
pub const CAP_STREAMING: u32 = 0x0400_0000;
pub const CAP_DEVICE_CAPS: u32 = 0x8000_0000;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_capability {
	pub driver: [u8; 16],
	pub card: [u8; 32],
	pub bus_info: [u8; 32],
	pub version: u32,
	pub capabilities: u32,
	pub device_caps: u32,
	pub reserved: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct v4l2_pix_format {
	pub width: u32,
	pub height: u32,
	pub pixelformat: u32,
	pub field: u32,
	pub bytesperline: u32,
	pub sizeimage: u32,
	pub colorspace: u32,
	pub priv_: u32,
	pub flags: u32,
	pub ycbcr_enc: u32,
	pub quantization: u32,
	pub xfer_func: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_format_union {
	pub pix: v4l2_pix_format,
	pub raw_data: [u8; 200],
	// Other members contain pointers, which forces 8 byte alignment on 64-bit targets.
	_align: [usize; 200 / mem::size_of::<usize>()],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_format {
	pub type_: u32,
	pub fmt: v4l2_format_union,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct v4l2_requestbuffers {
	pub count: u32,
	pub type_: u32,
	pub memory: u32,
	pub capabilities: u32,
	pub flags: u8,
	pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct v4l2_timecode {
	pub type_: u32,
	pub flags: u32,
	pub frames: u8,
	pub seconds: u8,
	pub minutes: u8,
	pub hours: u8,
	pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_buffer_m {
	pub offset: u32,
	pub userptr: libc::c_ulong,
	pub planes: *mut libc::c_void,
	pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_buffer {
	pub index: u32,
	pub type_: u32,
	pub bytesused: u32,
	pub flags: u32,
	pub field: u32,
	pub timestamp: libc::timeval,
	pub timecode: v4l2_timecode,
	pub sequence: u32,
	pub memory: u32,
	pub m: v4l2_buffer_m,
	pub length: u32,
	pub reserved2: u32,
	pub request_fd: i32,
}

impl v4l2_buffer {
	pub fn output_mmap(index: u32) -> Self {
		// SAFETY: All-zero is a valid value for this plain C struct.
		let mut buf: Self = unsafe { mem::zeroed() };
		buf.index = index;
		buf.type_ = BUF_TYPE_VIDEO_OUTPUT;
		buf.memory = MEMORY_MMAP;
		buf
	}
}

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc<T>(dir: u32, nr: u32) -> u32 {
	(dir << 30) | ((mem::size_of::<T>() as u32) << 16) | ((b'V' as u32) << 8) | nr
}

pub const VIDIOC_QUERYCAP: u32 = ioc::<v4l2_capability>(IOC_READ, 0);
pub const VIDIOC_S_FMT: u32 = ioc::<v4l2_format>(IOC_READ | IOC_WRITE, 5);
pub const VIDIOC_REQBUFS: u32 = ioc::<v4l2_requestbuffers>(IOC_READ | IOC_WRITE, 8);
pub const VIDIOC_QUERYBUF: u32 = ioc::<v4l2_buffer>(IOC_READ | IOC_WRITE, 9);
pub const VIDIOC_QBUF: u32 = ioc::<v4l2_buffer>(IOC_READ | IOC_WRITE, 15);
pub const VIDIOC_DQBUF: u32 = ioc::<v4l2_buffer>(IOC_READ | IOC_WRITE, 17);
pub const VIDIOC_STREAMON: u32 = ioc::<libc::c_int>(IOC_WRITE, 18);
pub const VIDIOC_STREAMOFF: u32 = ioc::<libc::c_int>(IOC_WRITE, 19);

/// Issue an ioctl, retrying when interrupted by a signal.
///
/// # Safety
/// `arg` must point to the struct the request expects.
pub unsafe fn ioctl<T>(fd: RawFd, request: u32, arg: *mut T) -> io::Result<()> {
	loop {
		// The request type differs between libc implementations.
		if unsafe { libc::ioctl(fd, request as _, arg) } != -1 {
			return Ok(());
		}

		let err = io::Error::last_os_error();
		if err.kind() != io::ErrorKind::Interrupted {
			return Err(err);
		}
	}
}

/// Convert a NUL padded C string field.
pub fn c_str(bytes: &[u8]) -> String {
	let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
	String::from_utf8_lossy(&bytes[..end]).into_owned()
}
