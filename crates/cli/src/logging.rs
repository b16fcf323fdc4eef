//! Log output.
//!
//! Formatted lines go through a bounded `tracing-appender` queue drained by a
//! worker thread into the sink. A full queue blocks the logging caller until
//! the worker catches up; lines are never dropped.

use std::io::Write;

use tracing_appender::non_blocking::{NonBlocking, NonBlockingBuilder, WorkerGuard};

/// Writer for `tracing_subscriber::fmt::layer().with_writer()`. Queued lines
/// are flushed when the returned guard is dropped, so keep it alive in `main`.
pub fn bounded_writer<W>(capacity: usize, sink: W) -> (NonBlocking, WorkerGuard)
where
    W: Write + Send + 'static,
{
    NonBlockingBuilder::default()
        .buffered_lines_limit(capacity.max(1))
        .lossy(false)
        .thread_name("log-drain")
        .finish(sink)
}
