//! Fixed-length byte ranges backing each pool slot.

use std::{fmt, io, ptr::NonNull};

#[cfg(unix)]
use std::os::fd::{AsRawFd, BorrowedFd};

/// A fixed-length range of memory, unmapped or freed on drop.
///
/// A region hands out raw access only; the [crate::BufferPool] decides who may touch it.
pub struct Region {
	ptr: NonNull<u8>,
	len: usize,
	kind: Kind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
	Heap,
	#[cfg(unix)]
	Mapped,
}

// SAFETY: A region is a plain allocation with no thread affinity.
// Exclusive access to the contents is enforced by the slot state machine.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
	/// Allocate a zeroed region on the heap.
	pub fn alloc(len: usize) -> Self {
		let boxed: Box<[u8]> = vec![0; len].into_boxed_slice();
		let raw = Box::into_raw(boxed) as *mut u8;

		Self {
			// SAFETY: Box never returns null, even for empty slices.
			ptr: unsafe { NonNull::new_unchecked(raw) },
			len,
			kind: Kind::Heap,
		}
	}

	/// Map `len` bytes of the device memory at `offset`, shared with the device.
	#[cfg(unix)]
	pub fn map(fd: BorrowedFd<'_>, offset: u64, len: usize) -> io::Result<Self> {
		let offset = libc::off_t::try_from(offset).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

		// SAFETY: We request a fresh mapping; the kernel picks the address.
		let ptr = unsafe {
			libc::mmap(
				std::ptr::null_mut(),
				len,
				libc::PROT_READ | libc::PROT_WRITE,
				libc::MAP_SHARED,
				fd.as_raw_fd(),
				offset,
			)
		};

		if ptr == libc::MAP_FAILED {
			return Err(io::Error::last_os_error());
		}

		let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| io::Error::other("mmap returned null"))?;

		Ok(Self {
			ptr,
			len,
			kind: Kind::Mapped,
		})
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Borrow the contents.
	///
	/// # Safety
	/// Nobody may be writing to the region for the lifetime of the slice.
	pub unsafe fn as_slice(&self) -> &[u8] {
		unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
	}

	/// Mutably borrow the contents.
	///
	/// # Safety
	/// The caller must have exclusive access to the region for the lifetime of the slice.
	#[allow(clippy::mut_from_ref)]
	pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
		unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
	}
}

impl fmt::Debug for Region {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Region")
			.field("len", &self.len)
			.field("kind", &self.kind)
			.finish()
	}
}

impl Drop for Region {
	fn drop(&mut self) {
		match self.kind {
			Kind::Heap => {
				let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
				// SAFETY: Created by Box::into_raw in Region::alloc.
				drop(unsafe { Box::from_raw(slice) });
			}
			#[cfg(unix)]
			Kind::Mapped => {
				// SAFETY: Created by mmap in Region::map with the same length.
				if unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) } != 0 {
					let err = io::Error::last_os_error();
					tracing::warn!(%err, len = self.len, "failed to unmap region");
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn alloc_zeroed() {
		let region = Region::alloc(64);
		assert_eq!(region.len(), 64);
		assert!(unsafe { region.as_slice() }.iter().all(|b| *b == 0));
	}

	#[test]
	fn alloc_write() {
		let region = Region::alloc(4);
		unsafe { region.as_mut_slice() }.copy_from_slice(b"YUYV");
		assert_eq!(unsafe { region.as_slice() }, b"YUYV");
	}

	#[test]
	fn alloc_empty() {
		let region = Region::alloc(0);
		assert!(region.is_empty());
	}

	#[cfg(target_os = "linux")]
	#[test]
	fn map_file() {
		use std::io::Write;
		use std::os::fd::AsFd;

		let path = std::env::temp_dir().join(format!("loopfeed-region-{}", std::process::id()));
		let mut file = std::fs::OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.truncate(true)
			.open(&path)
			.unwrap();
		file.write_all(&[7; 4096]).unwrap();

		let region = Region::map(file.as_fd(), 0, 4096).unwrap();
		assert!(unsafe { region.as_slice() }.iter().all(|b| *b == 7));
		drop(region);

		std::fs::remove_file(path).unwrap();
	}
}
