use flexi_logger::{
    opt_format, Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming,
};
use std::path::Path;

use crate::Result;

/// Log to `train_*.log` files in `dir` and mirror `Info` and above to stderr.
/// `RUST_LOG` takes precedence over `level`. Keep the returned handle alive
/// for as long as logging is needed.
pub fn setup_logging(dir: impl AsRef<Path>, level: &str) -> Result<LoggerHandle> {
    let handle = Logger::try_with_env_or_str(level)?
        .log_to_file(FileSpec::default().directory(dir.as_ref()).basename("train"))
        .duplicate_to_stderr(Duplicate::Info)
        .format(opt_format)
        .rotate(
            Criterion::Size(10 * 1024 * 1024),
            Naming::Numbers,
            Cleanup::KeepLogFiles(7),
        )
        .start()?;
    Ok(handle)
}
