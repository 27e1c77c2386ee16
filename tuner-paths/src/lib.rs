//! XDG Base Directory paths for tuner.
//!
//! CLI tools should use XDG paths for cross-platform consistency,
//! not platform-native paths. This matches tools like gh, docker, kubectl.

use std::path::PathBuf;

/// Directory name under the XDG base directories.
pub const APP_DIR: &str = "tuner";

/// Get the tuner config directory.
///
/// Returns `$XDG_CONFIG_HOME/tuner` if set, otherwise `~/.config/tuner`.
///
/// # Examples
///
/// ```
/// use tuner_paths::config_dir;
///
/// let config = config_dir();
/// assert!(config.ends_with("tuner"));
/// ```
pub fn config_dir() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config")
}

/// Get the tuner data directory.
///
/// Returns `$XDG_DATA_HOME/tuner` if set, otherwise `~/.local/share/tuner`.
/// The experiment database lives here.
pub fn data_dir() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", ".local/share")
}

/// User-level config file, `config_dir()/config.toml`.
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Default experiment database, `data_dir()/experiments.db`.
///
/// # Examples
///
/// ```
/// use tuner_paths::database_path;
///
/// assert_eq!(database_path().file_name().unwrap(), "experiments.db");
/// ```
pub fn database_path() -> PathBuf {
    data_dir().join("experiments.db")
}

fn xdg_dir(var: &str, home_fallback: &str) -> PathBuf {
    match std::env::var(var) {
        Ok(base) if !base.is_empty() => PathBuf::from(base).join(APP_DIR),
        _ => dirs::home_dir()
            .unwrap_or_default()
            .join(home_fallback)
            .join(APP_DIR),
    }
}
