pub(crate) mod ping;
pub(crate) mod stream;
pub(crate) mod ws;

use std::time::Duration;

/// Stand-in deadline when inactivity detection is disabled.
pub(crate) const NO_IDLE_LIMIT: Duration = Duration::from_secs(365 * 24 * 3600);
