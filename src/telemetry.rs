//! Process-wide tracing setup for the runner.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber: `RUST_LOG` filter (default `info`), human
/// readable or JSON lines on stderr. Returns `false` if a subscriber was
/// already installed.
pub fn init_tracing(json: bool) -> bool {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let registry = tracing_subscriber::registry().with(filter);

  let installed = if json {
    registry
      .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
      .try_init()
  } else {
    registry
      .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
      .try_init()
  };
  installed.is_ok()
}
