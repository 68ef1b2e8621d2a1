use std::time::Duration;

use crate::{BufferPool, Error, Result, device::Device, error::Strikes, source::FrameSource, throttle::Throttle};

/// What the producer did over a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProducerStats {
	/// Frames pulled from the source.
	pub frames: u64,
	/// Frames handed to the device.
	pub submitted: u64,
	/// Frames dropped because the device refused them.
	pub skipped: u64,
}

/// Fills free buffers with frames and hands them to the device.
pub(crate) struct Producer<'a, D: Device> {
	pool: &'a BufferPool,
	device: &'a D,
	throttle: Throttle,
	strikes: Strikes,
}

impl<'a, D: Device> Producer<'a, D> {
	pub fn new(pool: &'a BufferPool, device: &'a D, interval: Duration, max_errors: u32) -> Self {
		Self {
			pool,
			device,
			throttle: Throttle::new(interval),
			strikes: Strikes::new(max_errors),
		}
	}

	/// Stream frames until the source is exhausted or the pool is closed.
	///
	/// In-flight buffers are left for the consumer.
	pub fn run<S: FrameSource>(mut self, mut source: S) -> Result<ProducerStats> {
		let mut stats = ProducerStats::default();

		while source.next_frame()? {
			stats.frames += 1;
			self.throttle.wait();

			let mut claim = match self.pool.claim() {
				Ok(claim) => claim,
				Err(Error::Closed) => {
					tracing::debug!("pool closed, stopping producer");
					break;
				}
				Err(err) => return Err(err),
			};

			let index = claim.index();
			let used = source.fill(&mut claim)?;

			match claim.submit(|index| self.device.submit(index, used)) {
				Ok(()) => {
					tracing::debug!(index, used, "submitted buffer");
					stats.submitted += 1;
					self.strikes.reset();
				}
				Err(err @ (Error::DeviceBusy | Error::Device(_))) => {
					tracing::warn!(%err, index, frame = stats.frames, "skipping frame");
					stats.skipped += 1;
					self.strikes.strike()?;
				}
				Err(err) => return Err(err),
			}
		}

		tracing::info!(frames = stats.frames, submitted = stats.submitted, skipped = stats.skipped, "producer done");

		Ok(stats)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use crate::{FrameFormat, SlotState, device::MemoryDevice, source::PatternSource};

	fn setup(count: usize, format: FrameFormat) -> (BufferPool, MemoryDevice) {
		let device = MemoryDevice::new(count, format.frame_size()).manual();
		let regions = device
			.negotiate(count)
			.unwrap()
			.iter()
			.map(|info| device.map(info).unwrap())
			.collect();
		device.activate().unwrap();

		(BufferPool::new(regions).unwrap(), device)
	}

	#[test]
	fn fills_every_slot() {
		let format = FrameFormat::new(8, 2);
		let (pool, device) = setup(3, format);

		let producer = Producer::new(&pool, &device, Duration::ZERO, 0);
		let stats = producer.run(PatternSource::new(format, Some(3))).unwrap();

		assert_eq!(
			stats,
			ProducerStats {
				frames: 3,
				submitted: 3,
				skipped: 0
			}
		);
		assert_eq!(pool.counts().submitted, 3);
		assert_eq!(device.in_flight(), 3);
	}

	#[test]
	fn skips_busy() {
		let format = FrameFormat::new(8, 2);
		let (pool, device) = setup(2, format);
		device.fail_submit(1);

		let producer = Producer::new(&pool, &device, Duration::ZERO, 0);
		let stats = producer.run(PatternSource::new(format, Some(2))).unwrap();

		assert_eq!(stats.skipped, 1);
		assert_eq!(stats.submitted, 1);

		// The skipped frame gave its slot back.
		assert_eq!(pool.state(0), Some(SlotState::Submitted));
		assert_eq!(pool.state(1), Some(SlotState::Free));
	}

	#[test]
	fn strikes_out() {
		let format = FrameFormat::new(8, 2);
		let (pool, device) = setup(2, format);
		device.fail_submit(10);

		let producer = Producer::new(&pool, &device, Duration::ZERO, 3);
		let res = producer.run(PatternSource::new(format, None));

		assert!(matches!(res, Err(Error::TooManyErrors(3))));
		assert_eq!(pool.counts().free, 2);
	}

	#[test]
	fn stops_when_closed() {
		let format = FrameFormat::new(8, 2);
		let (pool, device) = setup(1, format);
		pool.close();

		let producer = Producer::new(&pool, &device, Duration::ZERO, 0);
		let stats = producer.run(PatternSource::new(format, None)).unwrap();

		assert_eq!(stats.frames, 1);
		assert_eq!(stats.submitted, 0);
	}

	#[test]
	fn frame_too_large() {
		let (pool, device) = setup(1, FrameFormat::new(8, 2));

		let producer = Producer::new(&pool, &device, Duration::ZERO, 0);
		let res = producer.run(PatternSource::new(FrameFormat::new(16, 16), None));

		assert!(matches!(res, Err(Error::TooSmall { .. })));
		assert_eq!(pool.state(0), Some(SlotState::Free));
	}
}
