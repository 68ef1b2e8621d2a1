use std::time::Duration;

use crate::{
	BufferPool, Error, Result,
	device::{Device, Readiness},
	error::Strikes,
};

/// What the consumer did over a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumerStats {
	/// Buffers returned to the pool.
	pub reclaimed: u64,
	/// Device failures and protocol violations that were logged and skipped.
	pub errors: u64,
}

/// Returns buffers to the pool once the device is finished with them.
pub(crate) struct Consumer<'a, D: Device> {
	pool: &'a BufferPool,
	device: &'a D,
	ready_timeout: Duration,
	strikes: Strikes,
}

impl<'a, D: Device> Consumer<'a, D> {
	pub fn new(pool: &'a BufferPool, device: &'a D, ready_timeout: Duration, max_errors: u32) -> Self {
		Self {
			pool,
			device,
			ready_timeout,
			strikes: Strikes::new(max_errors),
		}
	}

	/// Reclaim buffers until the pool is closed.
	///
	/// Closes the pool on failure so a blocked producer wakes up.
	pub fn run(mut self) -> Result<ConsumerStats> {
		let mut stats = ConsumerStats::default();

		let res = self.run_inner(&mut stats);
		if let Err(err) = &res {
			tracing::error!(%err, "consumer failed");
			self.pool.close();
		}

		tracing::info!(reclaimed = stats.reclaimed, errors = stats.errors, "consumer done");

		res.map(|_| stats)
	}

	fn run_inner(&mut self, stats: &mut ConsumerStats) -> Result<()> {
		loop {
			match self.pool.wait_submitted() {
				Ok(_) => {}
				Err(Error::Closed) => return Ok(()),
				Err(err) => return Err(err),
			}

			// Bounded so the closed flag is noticed even if the device never completes anything.
			match self.device.wait_ready(Some(self.ready_timeout)) {
				Ok(Readiness::Ready) => {}
				Ok(Readiness::TimedOut) => continue,
				Err(err) => {
					tracing::warn!(%err, "failed to wait for device");
					self.fail(stats)?;
					continue;
				}
			}

			let index = match self.device.reclaim() {
				Ok(Some(index)) => index,
				Ok(None) => continue,
				Err(err) => {
					tracing::warn!(%err, "failed to reclaim buffer");
					self.fail(stats)?;
					continue;
				}
			};

			match self.pool.mark_free(index) {
				Ok(()) => {
					tracing::debug!(index, "reclaimed buffer");
					stats.reclaimed += 1;
					self.strikes.reset();
				}
				Err(err) => {
					tracing::warn!(%err, index, "device returned a buffer that wasn't submitted");
					self.fail(stats)?;
				}
			}
		}
	}

	// Count the failure, then back off so a broken device isn't polled in a tight loop.
	fn fail(&mut self, stats: &mut ConsumerStats) -> Result<()> {
		stats.errors += 1;
		self.strikes.strike()?;

		std::thread::sleep(self.ready_timeout);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::{thread, time::Instant};

	use tracing_test::traced_test;

	use crate::{Region, SlotState, device::MemoryDevice};

	const TIMEOUT: Duration = Duration::from_millis(10);

	fn setup(count: usize) -> (BufferPool, MemoryDevice) {
		let device = MemoryDevice::new(count, 4).manual();
		let regions = device
			.negotiate(count)
			.unwrap()
			.iter()
			.map(|info| device.map(info).unwrap())
			.collect();
		device.activate().unwrap();

		(BufferPool::new(regions).unwrap(), device)
	}

	fn submit(pool: &BufferPool, device: &MemoryDevice) -> usize {
		let claim = pool.claim().unwrap();
		let index = claim.index();
		claim.submit(|index| device.submit(index, 4)).unwrap();
		index
	}

	#[test]
	fn reclaims_in_completion_order() {
		let (pool, device) = setup(3);
		for _ in 0..3 {
			submit(&pool, &device);
		}

		thread::scope(|scope| {
			let consumer = scope.spawn(|| Consumer::new(&pool, &device, TIMEOUT, 0).run());

			assert_eq!(device.complete(3), 3);
			assert_eq!(pool.wait_drained(Duration::from_secs(5)), 0);

			pool.close();
			let stats = consumer.join().unwrap().unwrap();
			assert_eq!(stats.reclaimed, 3);
			assert_eq!(stats.errors, 0);
		});
	}

	#[test]
	fn exits_when_idle() {
		let (pool, device) = setup(2);

		thread::scope(|scope| {
			let consumer = scope.spawn(|| Consumer::new(&pool, &device, TIMEOUT, 0).run());
			thread::sleep(TIMEOUT);
			pool.close();

			assert_eq!(consumer.join().unwrap().unwrap(), ConsumerStats::default());
		});
	}

	#[test]
	fn exits_while_device_stalled() {
		let (pool, device) = setup(2);
		submit(&pool, &device);

		thread::scope(|scope| {
			let consumer = scope.spawn(|| Consumer::new(&pool, &device, TIMEOUT, 0).run());

			// Nothing ever completes, so the consumer keeps timing out until it sees the flag.
			thread::sleep(TIMEOUT * 3);
			pool.close();

			assert_eq!(consumer.join().unwrap().unwrap().reclaimed, 0);
		});

		assert_eq!(pool.state(0), Some(SlotState::Submitted));
	}

	#[test]
	fn survives_reclaim_errors() {
		let (pool, device) = setup(1);
		submit(&pool, &device);
		device.fail_reclaim(2);
		device.complete(1);

		thread::scope(|scope| {
			let consumer = scope.spawn(|| Consumer::new(&pool, &device, TIMEOUT, 5).run());
			assert_eq!(pool.wait_drained(Duration::from_secs(5)), 0);

			pool.close();
			let stats = consumer.join().unwrap().unwrap();
			assert_eq!(stats.reclaimed, 1);
			assert_eq!(stats.errors, 2);
		});
	}

	#[test]
	fn too_many_errors_closes_pool() {
		let (pool, device) = setup(1);
		submit(&pool, &device);
		device.fail_reclaim(100);
		device.complete(1);

		let res = Consumer::new(&pool, &device, TIMEOUT, 3).run();
		assert!(matches!(res, Err(Error::TooManyErrors(3))));
		assert!(pool.is_closed());
	}

	#[test]
	fn rejects_unsubmitted() {
		// The device completes a buffer the pool never handed out.
		let pool = BufferPool::new(vec![Region::alloc(4), Region::alloc(4)]).unwrap();
		let device = MemoryDevice::new(2, 4).manual();
		device.negotiate(2).unwrap();
		device.activate().unwrap();
		device.submit(1, 4).unwrap();
		device.complete(1);

		// Only slot 0 is submitted as far as the pool knows.
		let claim = pool.claim().unwrap();
		claim.submit(|_| Ok(())).unwrap();

		let res = Consumer::new(&pool, &device, TIMEOUT, 1).run();
		assert!(matches!(res, Err(Error::TooManyErrors(1))));
		assert_eq!(pool.state(1), Some(SlotState::Free));
	}

	#[test]
	#[traced_test]
	fn survives_wait_errors() {
		let (pool, device) = setup(1);
		submit(&pool, &device);
		device.fail_wait(2);
		device.complete(1);

		// Run on this thread so the warnings land in the test's span.
		let stats = thread::scope(|scope| {
			scope.spawn(|| {
				pool.wait_drained(Duration::from_secs(5));
				pool.close();
			});

			Consumer::new(&pool, &device, TIMEOUT, 5).run().unwrap()
		});

		assert_eq!(stats.errors, 2);
		assert_eq!(stats.reclaimed, 1);
		assert_eq!(pool.state(0), Some(SlotState::Free));
		assert!(logs_contain("failed to wait for device"));
	}

	#[test]
	fn backs_off_after_errors() {
		let (pool, device) = setup(1);
		submit(&pool, &device);
		device.fail_wait(usize::MAX);

		let start = Instant::now();
		let stats = thread::scope(|scope| {
			scope.spawn(|| {
				thread::sleep(Duration::from_millis(100));
				pool.close();
			});

			// Never gives up, so only the close stops it.
			Consumer::new(&pool, &device, TIMEOUT, 0).run().unwrap()
		});

		// Roughly one attempt per timeout, not a busy loop.
		assert!(stats.errors >= 1);
		assert!(stats.errors <= 20, "{} errors in {:?}", stats.errors, start.elapsed());
	}
}
