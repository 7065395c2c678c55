//! Diagnostic log file
//!
//! Append-only, one timestamped line per event, next to the payload. Logging
//! is best effort: if the file cannot be opened the engine runs silently.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::EnvFilter;

pub const LOG_FILE: &str = "res_hook.log";

/// Filter directives, e.g. `RES_HOOK_LOG=res_hook_rs=debug`
pub const LOG_ENV: &str = "RES_HOOK_LOG";

static INITIALIZED: OnceLock<bool> = OnceLock::new();

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber writing to `dir/res_hook.log`.
///
/// Returns whether a log file is active. Only the first call has any effect.
pub fn init(dir: &Path) -> bool {
    *INITIALIZED.get_or_init(|| {
        let file = match OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE))
        {
            Ok(file) => file,
            Err(_) => return false,
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_ansi(false)
            .with_target(false)
            .with_thread_ids(true)
            .with_writer(Mutex::new(file))
            .try_init()
            .is_ok()
    })
}

/// Console logging for the front end
pub fn init_stderr() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_unwritable_location_is_not_fatal() {
        let missing = PathBuf::from("/nonexistent-res-hook-dir/nested");
        // Either this call fails to open the file, or an earlier call already
        // decided; neither may panic and repeated calls agree.
        let first = init(&missing);
        assert_eq!(init(&missing), first);
    }
}
