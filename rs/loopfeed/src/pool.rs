use std::{
	fmt,
	ops::{Deref, DerefMut},
	time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{Error, Region, Result};

/// Who currently owns a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
	/// Owned by the pool, available to the producer.
	Free,
	/// Owned by the producer while it fills the region.
	Claimed,
	/// Owned by the device until it is reclaimed.
	Submitted,
}

impl fmt::Display for SlotState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Free => write!(f, "free"),
			Self::Claimed => write!(f, "claimed"),
			Self::Submitted => write!(f, "submitted"),
		}
	}
}

/// A snapshot of how many slots are in each state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counts {
	pub free: usize,
	pub claimed: usize,
	pub submitted: usize,
}

#[derive(Debug)]
struct State {
	slots: Vec<SlotState>,
	closed: bool,
}

impl State {
	// Lowest index wins; every slot is interchangeable.
	fn find(&self, wanted: SlotState) -> Option<usize> {
		self.slots.iter().position(|state| *state == wanted)
	}

	fn find_free(&self) -> Option<usize> {
		self.find(SlotState::Free)
	}

	fn find_submitted(&self) -> Option<usize> {
		self.find(SlotState::Submitted)
	}

	fn count(&self, wanted: SlotState) -> usize {
		self.slots.iter().filter(|state| **state == wanted).count()
	}

	fn transition(&mut self, index: usize, from: SlotState, to: SlotState) -> Result<()> {
		let slot = self.slots.get_mut(index).ok_or(Error::InvalidIndex(index))?;
		if *slot != from {
			return Err(Error::InvalidState {
				index,
				actual: *slot,
				expected: from,
			});
		}

		*slot = to;
		Ok(())
	}
}

/// A fixed set of buffers handed back and forth between a producer and the device.
///
/// Each slot moves through `Free -> Claimed -> Submitted -> Free`.
/// A single lock guards the state of every slot, while the region contents are only ever touched by the current owner.
pub struct BufferPool {
	regions: Vec<Region>,
	state: Mutex<State>,

	// Notified when a slot becomes free, waited on by the producer.
	slot_freed: Condvar,

	// Notified when a slot is submitted, waited on by the consumer.
	slot_submitted: Condvar,
}

impl BufferPool {
	pub fn new(regions: Vec<Region>) -> Result<Self> {
		if regions.is_empty() {
			return Err(Error::EmptyPool);
		}

		let slots = vec![SlotState::Free; regions.len()];

		Ok(Self {
			regions,
			state: Mutex::new(State { slots, closed: false }),
			slot_freed: Condvar::new(),
			slot_submitted: Condvar::new(),
		})
	}

	/// The number of slots, fixed for the lifetime of the pool.
	pub fn len(&self) -> usize {
		self.regions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.regions.is_empty()
	}

	pub fn state(&self, index: usize) -> Option<SlotState> {
		self.state.lock().slots.get(index).copied()
	}

	pub fn counts(&self) -> Counts {
		let state = self.state.lock();
		Counts {
			free: state.count(SlotState::Free),
			claimed: state.count(SlotState::Claimed),
			submitted: state.count(SlotState::Submitted),
		}
	}

	/// Claim the lowest free slot, blocking until one is freed.
	///
	/// Returns [Error::Closed] if the pool is closed while waiting.
	pub fn claim(&self) -> Result<Claim<'_>> {
		let mut state = self.state.lock();

		loop {
			if state.closed {
				return Err(Error::Closed);
			}

			if let Some(index) = state.find_free() {
				return Ok(self.claim_locked(&mut state, index));
			}

			self.slot_freed.wait(&mut state);
		}
	}

	/// Claim the lowest free slot if there is one.
	pub fn try_claim(&self) -> Option<Claim<'_>> {
		let mut state = self.state.lock();
		if state.closed {
			return None;
		}

		let index = state.find_free()?;
		Some(self.claim_locked(&mut state, index))
	}

	fn claim_locked(&self, state: &mut MutexGuard<'_, State>, index: usize) -> Claim<'_> {
		// Flipped under the same lock as the scan, so nobody else can pick this slot.
		state.slots[index] = SlotState::Claimed;
		tracing::trace!(index, "claimed slot");

		Claim {
			pool: self,
			index,
			done: false,
		}
	}

	/// Move a claimed slot to submitted and wake the consumer.
	pub fn mark_submitted(&self, index: usize) -> Result<()> {
		let mut state = self.state.lock();
		Self::mark_submitted_locked(&mut state, index)?;
		drop(state);

		self.slot_submitted.notify_one();
		Ok(())
	}

	fn mark_submitted_locked(state: &mut State, index: usize) -> Result<()> {
		state.transition(index, SlotState::Claimed, SlotState::Submitted)
	}

	/// Move a submitted slot back to free and wake the producer.
	///
	/// Fails if the slot was not submitted, which catches double frees and bogus indices from the device.
	pub fn mark_free(&self, index: usize) -> Result<()> {
		let mut state = self.state.lock();
		state.transition(index, SlotState::Submitted, SlotState::Free)?;
		drop(state);

		// notify_all so a draining orchestrator wakes up too.
		self.slot_freed.notify_all();
		Ok(())
	}

	// Return a claimed slot that was never submitted.
	fn release(&self, index: usize) {
		let mut state = self.state.lock();
		if let Err(err) = state.transition(index, SlotState::Claimed, SlotState::Free) {
			tracing::error!(%err, "failed to release claim");
			return;
		}
		drop(state);

		self.slot_freed.notify_all();
	}

	/// Block until at least one slot is submitted, returning the lowest such index.
	///
	/// Returns [Error::Closed] once the pool is closed, even if slots are still submitted.
	pub fn wait_submitted(&self) -> Result<usize> {
		let mut state = self.state.lock();

		loop {
			if state.closed {
				return Err(Error::Closed);
			}

			if let Some(index) = state.find_submitted() {
				return Ok(index);
			}

			self.slot_submitted.wait(&mut state);
		}
	}

	/// Wait up to `timeout` for every submitted slot to be freed.
	///
	/// Returns the number of slots still submitted, zero when fully drained.
	pub fn wait_drained(&self, timeout: Duration) -> usize {
		let deadline = Instant::now() + timeout;
		let mut state = self.state.lock();

		loop {
			let submitted = state.count(SlotState::Submitted);
			if submitted == 0 || state.closed {
				return submitted;
			}

			if self.slot_freed.wait_until(&mut state, deadline).timed_out() {
				return state.count(SlotState::Submitted);
			}
		}
	}

	/// Stop the pool, waking every waiter with [Error::Closed].
	pub fn close(&self) {
		let mut state = self.state.lock();
		if state.closed {
			return;
		}
		state.closed = true;
		drop(state);

		self.slot_freed.notify_all();
		self.slot_submitted.notify_all();
	}

	pub fn is_closed(&self) -> bool {
		self.state.lock().closed
	}
}

impl fmt::Debug for BufferPool {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("BufferPool")
			.field("len", &self.len())
			.field("counts", &self.counts())
			.finish()
	}
}

/// Exclusive access to a claimed slot.
///
/// Dereferences to the slot's region. Dropping the claim without submitting returns the slot to the pool.
pub struct Claim<'a> {
	pool: &'a BufferPool,
	index: usize,
	done: bool,
}

impl Claim<'_> {
	pub fn index(&self) -> usize {
		self.index
	}

	/// Hand the slot to the device.
	///
	/// `submit` runs while the pool is locked, so a completion can't be reclaimed before the slot is marked submitted.
	/// It must not block. On error the slot goes back to the free list.
	pub fn submit<F>(mut self, submit: F) -> Result<()>
	where
		F: FnOnce(usize) -> Result<()>,
	{
		let mut state = self.pool.state.lock();
		submit(self.index)?;

		BufferPool::mark_submitted_locked(&mut state, self.index)?;
		self.done = true;
		drop(state);

		self.pool.slot_submitted.notify_one();
		Ok(())
	}
}

impl Deref for Claim<'_> {
	type Target = [u8];

	fn deref(&self) -> &[u8] {
		// SAFETY: The slot is claimed, so nobody else touches the region.
		unsafe { self.pool.regions[self.index].as_slice() }
	}
}

impl DerefMut for Claim<'_> {
	fn deref_mut(&mut self) -> &mut [u8] {
		// SAFETY: The slot is claimed, so nobody else touches the region.
		unsafe { self.pool.regions[self.index].as_mut_slice() }
	}
}

impl fmt::Debug for Claim<'_> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Claim").field("index", &self.index).finish()
	}
}

impl Drop for Claim<'_> {
	fn drop(&mut self) {
		if !self.done {
			self.pool.release(self.index);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::sync::{
		Arc,
		atomic::{AtomicBool, Ordering},
	};

	fn pool(count: usize) -> BufferPool {
		BufferPool::new((0..count).map(|_| Region::alloc(16)).collect()).unwrap()
	}

	fn submit(pool: &BufferPool) -> usize {
		let claim = pool.claim().unwrap();
		let index = claim.index();
		claim.submit(|_| Ok(())).unwrap();
		index
	}

	#[test]
	fn empty() {
		assert!(matches!(BufferPool::new(Vec::new()), Err(Error::EmptyPool)));
	}

	#[test]
	fn lowest_index_first() {
		let pool = pool(3);
		assert_eq!(submit(&pool), 0);
		assert_eq!(submit(&pool), 1);

		pool.mark_free(0).unwrap();
		assert_eq!(submit(&pool), 0);
		assert_eq!(submit(&pool), 2);
	}

	#[test]
	fn claim_is_exclusive() {
		let pool = pool(2);

		let first = pool.claim().unwrap();
		let second = pool.claim().unwrap();
		assert_ne!(first.index(), second.index());
		assert!(pool.try_claim().is_none());

		assert_eq!(pool.state(first.index()), Some(SlotState::Claimed));
		assert_eq!(
			pool.counts(),
			Counts {
				free: 0,
				claimed: 2,
				submitted: 0
			}
		);
	}

	#[test]
	fn claim_dropped() {
		let pool = pool(1);

		let claim = pool.claim().unwrap();
		drop(claim);

		assert_eq!(pool.state(0), Some(SlotState::Free));
	}

	#[test]
	fn claim_write() {
		let pool = pool(1);

		let mut claim = pool.claim().unwrap();
		claim[..4].copy_from_slice(b"abcd");
		assert_eq!(&claim[..4], b"abcd");
		assert_eq!(claim.len(), 16);
	}

	#[test]
	fn submit_failed() {
		let pool = pool(1);

		let claim = pool.claim().unwrap();
		let res = claim.submit(|_| Err(Error::DeviceBusy));
		assert!(matches!(res, Err(Error::DeviceBusy)));

		// The frame is skipped but the slot isn't lost.
		assert_eq!(pool.state(0), Some(SlotState::Free));
		assert_eq!(pool.counts().submitted, 0);
	}

	#[test]
	fn double_free() {
		let pool = pool(1);
		let index = submit(&pool);

		pool.mark_free(index).unwrap();
		assert!(matches!(
			pool.mark_free(index),
			Err(Error::InvalidState {
				actual: SlotState::Free,
				..
			})
		));
	}

	#[test]
	fn free_before_submit() {
		let pool = pool(1);

		let claim = pool.claim().unwrap();
		assert!(matches!(
			pool.mark_free(claim.index()),
			Err(Error::InvalidState {
				actual: SlotState::Claimed,
				..
			})
		));
	}

	#[test]
	fn invalid_index() {
		let pool = pool(1);
		assert!(matches!(pool.mark_free(5), Err(Error::InvalidIndex(5))));
		assert!(matches!(pool.mark_submitted(5), Err(Error::InvalidIndex(5))));
	}

	#[test]
	fn mark_submitted_requires_claim() {
		let pool = pool(1);
		assert!(matches!(pool.mark_submitted(0), Err(Error::InvalidState { .. })));

		let claim = pool.claim().unwrap();
		let index = claim.index();
		std::mem::forget(claim);

		pool.mark_submitted(index).unwrap();
		assert_eq!(pool.state(index), Some(SlotState::Submitted));
	}

	#[test]
	fn wait_submitted() {
		let pool = pool(4);
		submit(&pool);
		submit(&pool);
		pool.mark_free(0).unwrap();

		assert_eq!(pool.wait_submitted().unwrap(), 1);
	}

	#[test]
	fn backpressure() {
		let pool = Arc::new(pool(2));
		submit(&pool);
		submit(&pool);

		let claimed = Arc::new(AtomicBool::new(false));
		let handle = std::thread::spawn({
			let pool = pool.clone();
			let claimed = claimed.clone();
			move || {
				let claim = pool.claim().unwrap();
				claimed.store(true, Ordering::SeqCst);
				claim.index()
			}
		});

		// Every slot is submitted, so the producer must be parked.
		std::thread::sleep(Duration::from_millis(50));
		assert!(!claimed.load(Ordering::SeqCst));

		pool.mark_free(1).unwrap();
		assert_eq!(handle.join().unwrap(), 1);
		assert!(claimed.load(Ordering::SeqCst));
	}

	#[test]
	fn close_wakes_waiters() {
		let pool = Arc::new(pool(1));
		submit(&pool);

		let producer = std::thread::spawn({
			let pool = pool.clone();
			move || pool.claim().map(|claim| claim.index())
		});

		let idle = Arc::new(BufferPool::new(vec![Region::alloc(1)]).unwrap());
		let consumer = std::thread::spawn({
			let idle = idle.clone();
			move || idle.wait_submitted()
		});

		std::thread::sleep(Duration::from_millis(20));
		pool.close();
		idle.close();

		assert!(matches!(producer.join().unwrap(), Err(Error::Closed)));
		assert!(matches!(consumer.join().unwrap(), Err(Error::Closed)));
		assert!(pool.try_claim().is_none());
	}

	#[test]
	fn drained() {
		let pool = Arc::new(pool(3));
		for _ in 0..3 {
			submit(&pool);
		}

		let freer = std::thread::spawn({
			let pool = pool.clone();
			move || {
				for index in [2, 0, 1] {
					std::thread::sleep(Duration::from_millis(5));
					pool.mark_free(index).unwrap();
				}
			}
		});

		assert_eq!(pool.wait_drained(Duration::from_secs(5)), 0);
		freer.join().unwrap();
	}

	#[test]
	fn drain_timeout() {
		let pool = pool(3);
		for _ in 0..3 {
			submit(&pool);
		}
		pool.mark_free(1).unwrap();

		let start = Instant::now();
		assert_eq!(pool.wait_drained(Duration::from_millis(30)), 2);
		assert!(start.elapsed() >= Duration::from_millis(30));
	}

	#[test]
	fn submitted_never_exceeds_len() {
		let pool = Arc::new(pool(3));

		let consumer = std::thread::spawn({
			let pool = pool.clone();
			move || {
				let mut freed = 0;
				while let Ok(index) = pool.wait_submitted() {
					assert!(pool.counts().submitted <= 3);
					pool.mark_free(index).unwrap();
					freed += 1;
				}
				freed
			}
		});

		for _ in 0..200 {
			let claim = pool.claim().unwrap();
			claim.submit(|_| Ok(())).unwrap();
			let counts = pool.counts();
			assert!(counts.submitted <= 3);
			assert_eq!(counts.free + counts.claimed + counts.submitted, 3);
		}

		assert_eq!(pool.wait_drained(Duration::from_secs(5)), 0);
		pool.close();
		assert_eq!(consumer.join().unwrap(), 200);
	}
}
