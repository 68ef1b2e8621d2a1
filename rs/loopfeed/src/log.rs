use serde_with::DisplayFromStr;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Tracing log configuration.
#[serde_with::serde_as]
#[derive(Clone, clap::Args, serde::Serialize, serde::Deserialize, Debug)]
#[serde(deny_unknown_fields, default)]
#[non_exhaustive]
pub struct Log {
	/// The level filter to use, overridden by `RUST_LOG` if set.
	#[serde_as(as = "DisplayFromStr")]
	#[arg(id = "log-level", long = "log-level", default_value = "info", env = "LOOPFEED_LOG_LEVEL")]
	pub level: tracing::Level,
}

impl Default for Log {
	fn default() -> Self {
		Self {
			level: tracing::Level::INFO,
		}
	}
}

impl Log {
	pub fn level(&self) -> LevelFilter {
		LevelFilter::from_level(self.level)
	}

	/// Install a global subscriber writing to stderr.
	///
	/// Does nothing if a subscriber is already installed.
	pub fn init(&self) {
		let filter = EnvFilter::builder()
			.with_default_directive(self.level().into())
			.from_env_lossy();

		let fmt = tracing_subscriber::fmt::layer()
			.with_writer(std::io::stderr)
			.with_thread_names(true);

		if let Err(err) = tracing_subscriber::registry().with(filter).with(fmt).try_init() {
			tracing::debug!(%err, "subscriber already installed");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn level_from_toml() {
		let log: Log = toml::from_str(r#"level = "debug""#).unwrap();
		assert_eq!(log.level, tracing::Level::DEBUG);
		assert_eq!(log.level(), LevelFilter::DEBUG);
	}

	#[test]
	fn default_level() {
		let log: Log = toml::from_str("").unwrap();
		assert_eq!(log.level, tracing::Level::INFO);
	}
}
