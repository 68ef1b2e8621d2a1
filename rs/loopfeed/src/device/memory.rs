use std::{collections::VecDeque, time::Duration};

use parking_lot::{Condvar, Mutex};

use super::{Device, Readiness, RegionInfo};
use crate::{Error, Region, Result};

/// The order in which a [MemoryDevice] completes submitted buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Completion {
	/// Oldest submission first, like most drivers.
	#[default]
	Fifo,
	/// Newest submission first, to exercise out-of-order completion.
	Reverse,
}

/// Something that happened to a [MemoryDevice], recorded in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
	Submit { index: usize, bytes_used: usize },
	Reclaim { index: usize },
}

/// An in-process device that completes buffers without transmitting them anywhere.
///
/// Useful for tests and for running the pipeline without hardware.
/// Buffers complete as soon as they are submitted unless [MemoryDevice::manual] is used,
/// in which case [MemoryDevice::complete] releases them.
#[derive(Debug)]
pub struct MemoryDevice {
	max_buffers: usize,
	buffer_size: usize,
	order: Completion,
	auto: bool,

	state: Mutex<State>,
	ready: Condvar,
}

#[derive(Debug, Default)]
struct State {
	granted: usize,
	active: bool,
	activations: usize,

	// Submitted but not yet completed.
	queued: VecDeque<usize>,
	// Completed but not yet reclaimed.
	done: VecDeque<usize>,

	fail_submit: usize,
	fail_wait: usize,
	fail_reclaim: usize,

	max_in_flight: usize,
	history: Vec<Event>,
}

impl State {
	fn in_flight(&self) -> usize {
		self.queued.len() + self.done.len()
	}
}

impl MemoryDevice {
	/// A device granting up to `max_buffers` buffers of `buffer_size` bytes each.
	pub fn new(max_buffers: usize, buffer_size: usize) -> Self {
		Self {
			max_buffers,
			buffer_size,
			order: Completion::Fifo,
			auto: true,
			state: Default::default(),
			ready: Condvar::new(),
		}
	}

	pub fn with_completion(mut self, order: Completion) -> Self {
		self.order = order;
		self
	}

	/// Hold submitted buffers until [MemoryDevice::complete] is called.
	pub fn manual(mut self) -> Self {
		self.auto = false;
		self
	}

	/// Complete up to `count` queued buffers, returning how many were completed.
	pub fn complete(&self, count: usize) -> usize {
		let mut state = self.state.lock();

		let mut completed = 0;
		while completed < count {
			let next = match self.order {
				Completion::Fifo => state.queued.pop_front(),
				Completion::Reverse => state.queued.pop_back(),
			};

			let Some(index) = next else { break };
			state.done.push_back(index);
			completed += 1;
		}
		drop(state);

		if completed > 0 {
			self.ready.notify_all();
		}

		completed
	}

	/// Fail the next `count` submissions with [Error::DeviceBusy].
	pub fn fail_submit(&self, count: usize) {
		self.state.lock().fail_submit = count;
	}

	/// Fail the next `count` readiness waits with a device error.
	pub fn fail_wait(&self, count: usize) {
		self.state.lock().fail_wait = count;
	}

	/// Fail the next `count` reclaims with a device error.
	pub fn fail_reclaim(&self, count: usize) {
		self.state.lock().fail_reclaim = count;
	}

	/// The number of buffers submitted and not yet reclaimed.
	pub fn in_flight(&self) -> usize {
		self.state.lock().in_flight()
	}

	/// The most buffers that were ever in flight at once.
	pub fn max_in_flight(&self) -> usize {
		self.state.lock().max_in_flight
	}

	pub fn is_active(&self) -> bool {
		self.state.lock().active
	}

	/// How many times the stream was activated.
	pub fn activations(&self) -> usize {
		self.state.lock().activations
	}

	pub fn history(&self) -> Vec<Event> {
		self.state.lock().history.clone()
	}
}

impl Device for MemoryDevice {
	fn negotiate(&self, count: usize) -> Result<Vec<RegionInfo>> {
		let granted = count.min(self.max_buffers);
		self.state.lock().granted = granted;

		if granted < count {
			return Err(Error::InsufficientBuffers {
				requested: count,
				granted,
			});
		}

		Ok((0..granted)
			.map(|index| RegionInfo {
				index,
				offset: (index * self.buffer_size) as u64,
				len: self.buffer_size,
			})
			.collect())
	}

	fn map(&self, info: &RegionInfo) -> Result<Region> {
		if info.index >= self.state.lock().granted {
			return Err(Error::InvalidIndex(info.index));
		}

		Ok(Region::alloc(info.len))
	}

	fn activate(&self) -> Result<()> {
		let mut state = self.state.lock();
		state.active = true;
		state.activations += 1;
		Ok(())
	}

	fn deactivate(&self) -> Result<()> {
		let mut state = self.state.lock();
		state.active = false;

		// Like STREAMOFF, anything still queued is returned to the application.
		state.queued.clear();
		state.done.clear();

		drop(state);
		self.ready.notify_all();

		Ok(())
	}

	fn submit(&self, index: usize, bytes_used: usize) -> Result<()> {
		let mut state = self.state.lock();

		if !state.active {
			return Err(Error::Device(std::io::Error::other("stream is not active")));
		}

		if index >= state.granted {
			return Err(Error::InvalidIndex(index));
		}

		if bytes_used > self.buffer_size {
			return Err(Error::TooSmall {
				need: bytes_used,
				have: self.buffer_size,
			});
		}

		if state.fail_submit > 0 {
			state.fail_submit -= 1;
			return Err(Error::DeviceBusy);
		}

		if state.queued.contains(&index) || state.done.contains(&index) {
			return Err(Error::Device(std::io::Error::other(format!("buffer {index} already queued"))));
		}

		state.queued.push_back(index);
		state.history.push(Event::Submit { index, bytes_used });
		state.max_in_flight = state.max_in_flight.max(state.in_flight());
		drop(state);

		if self.auto {
			self.complete(1);
		}

		Ok(())
	}

	fn wait_ready(&self, timeout: Option<Duration>) -> Result<Readiness> {
		let mut state = self.state.lock();

		if state.fail_wait > 0 {
			state.fail_wait -= 1;
			return Err(Error::Device(std::io::Error::other("injected wait failure")));
		}

		match timeout {
			Some(timeout) => {
				let res = self
					.ready
					.wait_while_for(&mut state, |state| state.done.is_empty(), timeout);
				if res.timed_out() && state.done.is_empty() {
					return Ok(Readiness::TimedOut);
				}
			}
			None => self.ready.wait_while(&mut state, |state| state.done.is_empty()),
		}

		Ok(Readiness::Ready)
	}

	fn reclaim(&self) -> Result<Option<usize>> {
		let mut state = self.state.lock();

		if state.fail_reclaim > 0 {
			state.fail_reclaim -= 1;
			return Err(Error::Device(std::io::Error::other("injected reclaim failure")));
		}

		let index = state.done.pop_front();
		if let Some(index) = index {
			state.history.push(Event::Reclaim { index });
		}

		Ok(index)
	}
}
