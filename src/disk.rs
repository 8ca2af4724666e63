use crate::error::{LauncherError, Result};
use log::{info, warn};
use std::path::Path;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Free space on the volume holding `path`, in GB. The nearest existing
/// ancestor is measured when `path` itself is not created yet.
pub fn available_gb(path: &Path) -> Result<f64> {
    let probe = path
        .ancestors()
        .find(|candidate| candidate.exists())
        .unwrap_or(path);
    let bytes = fs2::available_space(probe)?;
    Ok(bytes as f64 / BYTES_PER_GB)
}

/// Unmeasurable volumes count as having room; the install fails later
/// with a real I/O error instead.
pub fn has_enough_space(path: &Path, required_gb: f64) -> bool {
    match available_gb(path) {
        Ok(available) => available >= required_gb,
        Err(err) => {
            warn!("Could not measure free space at {path:?}: {err}");
            true
        }
    }
}

pub fn ensure_space(path: &Path, required_gb: f64) -> Result<()> {
    let available_gb = available_gb(path)?;
    if available_gb < required_gb {
        return Err(LauncherError::InsufficientDiskSpace {
            path: path.to_path_buf(),
            available_gb,
            required_gb,
        });
    }
    info!("{available_gb:.1} GB free at {path:?} ({required_gb:.1} GB required).");
    Ok(())
}
