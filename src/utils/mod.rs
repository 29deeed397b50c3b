pub mod clock;
pub mod logging;

use std::path::PathBuf;
use which::which;

use crate::errors::{AppError, Result};

pub use clock::{Clock, SystemClock};
pub use logging::LogContext;

/// Finds an executable in the system PATH.
pub fn find_executable(name: &str) -> Result<PathBuf> {
    which(name).map_err(|_| {
        AppError::ToolNotFound(format!(
            "{} executable not found in PATH. Please ensure the database client tools are installed and in your PATH.",
            name
        ))
    })
}
