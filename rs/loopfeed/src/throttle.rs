use std::time::{Duration, Instant};

/// Spaces out frames by a fixed interval.
///
/// The interval is measured between calls to [Throttle::wait], so any time spent elsewhere (including blocking on
/// a full pool) counts against it. A zero interval never sleeps.
#[derive(Debug)]
pub(crate) struct Throttle {
	interval: Duration,
	last: Option<Instant>,
}

impl Throttle {
	pub fn new(interval: Duration) -> Self {
		Self { interval, last: None }
	}

	/// Sleep until one interval has passed since the previous call, returning how long we slept.
	pub fn wait(&mut self) -> Duration {
		if self.interval.is_zero() {
			return Duration::ZERO;
		}

		let mut slept = Duration::ZERO;

		if let Some(last) = self.last {
			let deadline = last + self.interval;
			let now = Instant::now();

			if deadline > now {
				slept = deadline - now;
				std::thread::sleep(slept);
			}
		}

		self.last = Some(Instant::now());
		slept
	}
}
