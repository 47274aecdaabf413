use std::env;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global tracing subscriber. Level defaults to `info` and is
/// overridden by `RUST_LOG`. Call once, early in main.
pub fn setup_logging() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let json = env::var("LOG_FORMAT").as_deref() == Ok("json");
	if json {
		tracing_subscriber::registry()
			.with(filter)
			.with(fmt::layer().json().with_target(true))
			.init();
	} else {
		tracing_subscriber::registry()
			.with(filter)
			.with(fmt::layer().with_target(true))
			.init();
	}
}

pub mod testing {
	use tracing_subscriber::EnvFilter;

	/// Best-effort subscriber for tests; repeated calls are fine.
	pub fn setup_test_logging() {
		let _ = tracing_subscriber::fmt()
			.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
			.with_test_writer()
			.try_init();
	}
}
