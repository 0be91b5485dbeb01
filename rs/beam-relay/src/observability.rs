//! Logging setup for embedding applications.

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `directive` is the default filter (e.g. `"info"` or
/// `"beam_relay=debug,beam_media=info"`); `RUST_LOG` overrides it. Safe to
/// call once per process; embedding applications that install their own
/// subscriber should skip this.
pub fn init(directive: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
	let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(directive))?;

	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(true)
		.try_init()?;

	Ok(())
}
