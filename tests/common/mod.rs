#![allow(dead_code, unused_imports)]

use std::io;
use std::path::Path;

use gangway::exec::logs::{Console, LogCopyError, LogMultiplexer};
use tokio::sync::mpsc;

pub use gangway_test_utils::builders::{self, BuildMetaBuilder, unit_spec};
pub use gangway_test_utils::{init_tracing, with_timeout};

/// Multiplexer writing files under `dir` with console output discarded.
pub fn quiet_logs(dir: &Path) -> (LogMultiplexer, mpsc::UnboundedReceiver<LogCopyError>) {
    LogMultiplexer::new(dir, Console::new(io::sink()))
}
