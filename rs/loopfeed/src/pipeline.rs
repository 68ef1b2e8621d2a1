use std::{fmt, panic, thread};

use crate::{
	BufferPool, ConsumerStats, Error, PipelineConfig, ProducerStats, Result,
	consumer::Consumer,
	device::Device,
	producer::Producer,
	source::FrameSource,
};

/// The outcome of a complete run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Report {
	pub producer: ProducerStats,
	pub consumer: ConsumerStats,

	/// Buffers still owned by the device when the drain timed out.
	pub abandoned: usize,
}

impl fmt::Display for Report {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"frames={} submitted={} skipped={} reclaimed={} errors={} abandoned={}",
			self.producer.frames,
			self.producer.submitted,
			self.producer.skipped,
			self.consumer.reclaimed,
			self.consumer.errors,
			self.abandoned
		)
	}
}

/// Streams frames from a source to a device through a pool of device buffers.
///
/// Buffers are negotiated and mapped up front. [Pipeline::run] then activates the stream,
/// runs a producer and consumer thread until the source is exhausted, and tears everything down.
pub struct Pipeline<D: Device> {
	// Dropped before the device, so every region is unmapped before the device releases its buffers.
	pool: BufferPool,
	device: D,
	config: PipelineConfig,
}

impl<D: Device> Pipeline<D> {
	/// Negotiate and map `config.buffers` buffers.
	///
	/// Fails if the device grants fewer buffers than requested. Nothing is started on failure.
	pub fn new(device: D, config: &PipelineConfig) -> Result<Self> {
		if config.buffers == 0 {
			return Err(Error::EmptyPool);
		}

		let infos = device.negotiate(config.buffers)?;
		tracing::debug!(buffers = infos.len(), "negotiated buffers");

		let mut regions = Vec::with_capacity(infos.len());
		for info in &infos {
			match device.map(info) {
				Ok(region) => regions.push(region),
				Err(err) => {
					// Dropping the regions unmaps them.
					tracing::warn!(%err, index = info.index, mapped = regions.len(), "failed to map buffer");
					return Err(err);
				}
			}
		}

		let pool = BufferPool::new(regions)?;
		tracing::info!(buffers = pool.len(), "mapped buffers");

		Ok(Self {
			pool,
			device,
			config: config.clone(),
		})
	}

	pub fn pool(&self) -> &BufferPool {
		&self.pool
	}

	/// Stream every frame from `source`, returning once all buffers are drained or abandoned.
	pub fn run<S: FrameSource + Send>(self, source: S) -> Result<Report> {
		tracing::info!(format = %source.format(), buffers = self.pool.len(), "starting stream");

		self.device.activate()?;

		let res = thread::scope(|scope| self.run_scoped(scope, source));

		let deactivated = self.device.deactivate();
		if let Err(err) = &deactivated {
			tracing::warn!(%err, "failed to deactivate device");
		}

		let report = res?;
		deactivated?;

		tracing::info!(%report, "stream finished");
		Ok(report)
	}

	fn run_scoped<'scope, 'env, S>(&'env self, scope: &'scope thread::Scope<'scope, 'env>, source: S) -> Result<Report>
	where
		S: FrameSource + Send + 'env,
	{
		let (pool, device, config) = (&self.pool, &self.device, &self.config);

		// Created here so both threads log under the caller's span.
		let consumer_span = tracing::info_span!("consumer");
		let producer_span = tracing::info_span!("producer");

		let consumer = thread::Builder::new()
			.name("loopfeed-consumer".into())
			.spawn_scoped(scope, move || {
				let _span = consumer_span.entered();
				Consumer::new(pool, device, config.ready_timeout, config.max_device_errors).run()
			})
			.map_err(Error::Spawn)?;

		let producer = thread::Builder::new()
			.name("loopfeed-producer".into())
			.spawn_scoped(scope, move || {
				let _span = producer_span.entered();
				Producer::new(pool, device, config.interval, config.max_device_errors).run(source)
			});

		let producer = match producer {
			Ok(producer) => producer,
			Err(err) => {
				// Let the consumer exit so the scope can join it.
				self.pool.close();
				return Err(Error::Spawn(err));
			}
		};

		let produced = producer.join().unwrap_or_else(|err| {
			self.pool.close();
			panic::resume_unwind(err)
		});

		let abandoned = match &produced {
			Ok(_) => self.drain(),
			Err(_) => self.pool.counts().submitted,
		};

		self.pool.close();

		let consumed = consumer.join().unwrap_or_else(|err| panic::resume_unwind(err));

		let producer = match (produced, consumed.as_ref()) {
			(Ok(stats), _) => stats,
			(Err(err), Err(other)) => {
				tracing::warn!(err = %other, "consumer failed too");
				return Err(err);
			}
			(Err(err), Ok(_)) => return Err(err),
		};

		Ok(Report {
			producer,
			consumer: consumed?,
			abandoned,
		})
	}

	// Wait for the device to hand back every submitted buffer, up to the drain timeout.
	fn drain(&self) -> usize {
		let submitted = self.pool.counts().submitted;
		tracing::debug!(submitted, "draining");

		let abandoned = self.pool.wait_drained(self.config.drain_timeout);
		if abandoned == 0 {
			return 0;
		}

		// The consumer closes the pool when it gives up, which also ends the wait early.
		if self.pool.is_closed() {
			tracing::warn!(abandoned, "pool closed while draining, abandoning buffers");
		} else {
			tracing::warn!(abandoned, timeout = ?self.config.drain_timeout, "drain timed out, abandoning buffers");
		}

		abandoned
	}
}

impl<D: Device + fmt::Debug> fmt::Debug for Pipeline<D> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Pipeline")
			.field("pool", &self.pool)
			.field("device", &self.device)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::time::Duration;

	use tracing_test::traced_test;

	use crate::{FrameFormat, device::MemoryDevice, source::PatternSource};

	fn config(buffers: usize) -> PipelineConfig {
		PipelineConfig {
			buffers,
			interval: Duration::ZERO,
			drain_timeout: Duration::from_secs(5),
			ready_timeout: Duration::from_millis(10),
			max_device_errors: 4,
		}
	}

	#[test]
	fn report_display() {
		let report = Report {
			producer: ProducerStats {
				frames: 3,
				submitted: 2,
				skipped: 1,
			},
			consumer: ConsumerStats {
				reclaimed: 2,
				errors: 0,
			},
			abandoned: 0,
		};

		assert_eq!(
			report.to_string(),
			"frames=3 submitted=2 skipped=1 reclaimed=2 errors=0 abandoned=0"
		);
	}

	#[test]
	fn zero_buffers() {
		let device = MemoryDevice::new(4, 16);
		assert!(matches!(Pipeline::new(&device, &config(0)), Err(Error::EmptyPool)));
	}

	#[test]
	fn runs() {
		let format = FrameFormat::new(8, 4);
		let device = MemoryDevice::new(4, format.frame_size());

		let pipeline = Pipeline::new(&device, &config(4)).unwrap();
		assert_eq!(pipeline.pool().len(), 4);

		let report = pipeline.run(PatternSource::new(format, Some(20))).unwrap();
		assert_eq!(report.producer.submitted, 20);
		assert_eq!(report.consumer.reclaimed, 20);
		assert_eq!(report.abandoned, 0);

		assert_eq!(device.activations(), 1);
		assert!(!device.is_active());
	}

	#[test]
	fn producer_failure_stops_consumer() {
		let format = FrameFormat::new(8, 4);
		let device = MemoryDevice::new(2, format.frame_size());
		device.fail_submit(100);

		let pipeline = Pipeline::new(&device, &config(2)).unwrap();
		let res = pipeline.run(PatternSource::new(format, None));

		assert!(matches!(res, Err(Error::TooManyErrors(4))));
		assert!(!device.is_active());
	}

	#[test]
	#[traced_test]
	fn consumer_failure_during_drain() {
		let format = FrameFormat::new(8, 4);
		let device = MemoryDevice::new(2, format.frame_size());
		device.fail_reclaim(100);

		// Both frames are submitted right away, then the consumer strikes out while we drain.
		let pipeline = Pipeline::new(&device, &config(2)).unwrap();
		let res = pipeline.run(PatternSource::new(format, Some(2)));

		assert!(matches!(res, Err(Error::TooManyErrors(4))));
		assert!(logs_contain("pool closed while draining"));
		assert!(!logs_contain("drain timed out"));
	}
}
