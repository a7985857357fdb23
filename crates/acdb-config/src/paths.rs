//! Platform-specific paths for the runtime's configuration file and its
//! default writable directory (used for delta-file persistence by
//! `acdb-registry`).
//!
//! - **User config**: `~/.config/acdb/` (Linux), `~/Library/Application
//!   Support/acdb/` (macOS), `%APPDATA%\acdb\` (Windows).
//! - **Writable dir**: `<user config>/writable/`, mirroring the on-device
//!   partition the satellite is allowed to persist calibration deltas to.

use std::path::PathBuf;

const APP_NAME: &str = "acdb";
const WRITABLE_SUBDIR: &str = "writable";

/// Returns the user-specific configuration directory.
///
/// Falls back to `.` if the platform config directory cannot be determined.
pub fn user_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Returns the default path to `acdb.toml` inside [`user_config_dir`].
pub fn default_config_file() -> PathBuf {
    user_config_dir().join("acdb.toml")
}

/// Returns the default writable directory for delta-file persistence.
pub fn default_writable_dir() -> PathBuf {
    user_config_dir().join(WRITABLE_SUBDIR)
}

/// Ensures `dir` exists, creating all parent directories if needed.
pub fn ensure_dir(dir: &std::path::Path) -> Result<(), crate::ConfigError> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| crate::ConfigError::create_dir(dir, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_config_dir_contains_app_name() {
        let dir = user_config_dir();
        assert!(dir.to_string_lossy().contains("acdb"));
    }

    #[test]
    fn default_config_file_lives_under_user_config_dir() {
        assert_eq!(default_config_file(), user_config_dir().join("acdb.toml"));
    }

    #[test]
    fn ensure_dir_creates_missing_directory() {
        let temp = tempfile::TempDir::new().unwrap();
        let target = temp.path().join("nested").join("writable");
        assert!(!target.exists());
        ensure_dir(&target).unwrap();
        assert!(target.is_dir());
    }
}
