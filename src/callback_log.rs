//! Bridges the `log` facade to a user-supplied log callback (spec §6
//! `set_log_callback`).
//!
//! The teacher doesn't install a `log::Log` implementation anywhere
//! (its own internal logging is the BFT decision log, an unrelated
//! concept); this bridge follows `log`'s own documented pattern for a
//! custom sink, which is the natural "ambient logging" counterpart the
//! teacher leaves to its caller (its binaries just call
//! `env_logger::init()`). `chirp` instead needs calls routed to a
//! callback the host application owns, since the original library has
//! no notion of stderr at all.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::{Level, Log, Metadata, Record};

use crate::error::{Error, ErrorKind, Result};

/// A host-supplied log sink. Invoked with the level, the formatted
/// message, and the originating module path.
pub type LogCallback = Box<dyn Fn(Level, &str, &str) + Send + Sync>;

struct CallbackLogger {
    cb: Mutex<LogCallback>,
}

impl Log for CallbackLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let cb = self.cb.lock().unwrap_or_else(|e| e.into_inner());
        cb(record.level(), &record.args().to_string(), record.target());
    }

    fn flush(&self) {}
}

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Installs `cb` as the process-wide log sink for every `log` crate
/// call made by `chirp` (and anything else in the process using `log`).
/// Spec's `set_log_callback` is a per-node API; `log`'s backing facade
/// is process-wide, so only the first caller wins — later callers get
/// [`ErrorKind::InProgress`], matching the spec's `IN_PROGRESS` pattern
/// for "already started" conditions.
pub fn set_log_callback(cb: LogCallback) -> Result<()> {
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return Err(Error::simple(ErrorKind::InProgress));
    }
    let logger = Box::new(CallbackLogger { cb: Mutex::new(cb) });
    log::set_boxed_logger(logger)
        .map(|()| log::set_max_level(log::LevelFilter::Trace))
        .map_err(|e| Error::wrapped(ErrorKind::Fatal, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn reports_in_progress_on_second_install() {
        // `log::set_boxed_logger` itself is also process-global and can
        // only succeed once per test binary; this test only exercises
        // our own swap-based guard, not the underlying `log` call.
        if INSTALLED.swap(true, Ordering::AcqRel) {
            // already installed by an earlier test in this binary; skip
            return;
        }
        INSTALLED.store(false, Ordering::Release);

        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen2 = seen.clone();
        let first = set_log_callback(Box::new(move |_, _, _| {
            seen2.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(first.is_ok());

        let second = set_log_callback(Box::new(|_, _, _| {}));
        assert_eq!(second.unwrap_err().kind(), ErrorKind::InProgress);
    }
}
