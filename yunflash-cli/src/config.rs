//! Configuration file support for yunflash.
//!
//! Settings are resolved highest priority first:
//! 1. Command-line arguments
//! 2. Environment variables (YUNFLASH_*)
//! 3. Local config file (./yunflash.toml)
//! 4. Global config file (~/.config/yunflash/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Settings a config file may provide.
///
/// Every field is optional; command-line flags and environment variables win
/// over anything found here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Serial port of the board (e.g., "/dev/ttyACM0" or "COM3").
    pub port: Option<String>,
    /// Board name written into the U-Boot environment.
    pub board: Option<String>,
    /// Directory the firmware images are served from.
    pub firmware_dir: Option<PathBuf>,
    /// Directory holding avrdude and the bridge sketch.
    pub tools_dir: Option<PathBuf>,
    /// Total attempt budget for the update.
    pub max_attempts: Option<u32>,
}

impl Config {
    /// Read the global config file, then the local one on top of it.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global) = Self::load_from_file(&global_path) {
                debug!("Global config: {}", global_path.display());
                config.merge(global);
            }
        }

        if let Some(local) = Self::load_from_file(Path::new("yunflash.toml")) {
            debug!("Local config: yunflash.toml");
            config.merge(local);
        }

        config
    }

    /// Read the file named with `--config`. Unreadable files warn and fall
    /// back to defaults rather than aborting the update.
    pub fn load_from_path(path: &Path) -> Self {
        match Self::load_from_file(path) {
            Some(config) => {
                debug!("Config: {}", path.display());
                config
            }
            None => {
                warn!("Could not load {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read config file {}: {e}", path.display());
                return None;
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Failed to parse config file {}: {e}", path.display());
                None
            }
        }
    }

    /// Per-user configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "yunflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Per-user configuration file.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one, the other taking precedence.
    fn merge(&mut self, other: Self) {
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.board.is_some() {
            self.board = other.board;
        }
        if other.firmware_dir.is_some() {
            self.firmware_dir = other.firmware_dir;
        }
        if other.tools_dir.is_some() {
            self.tools_dir = other.tools_dir;
        }
        if other.max_attempts.is_some() {
            self.max_attempts = other.max_attempts;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- defaults ----

    #[test]
    fn test_default_leaves_everything_unset() {
        let config = Config::default();
        assert!(config.port.is_none());
        assert!(config.board.is_none());
        assert!(config.firmware_dir.is_none());
        assert!(config.tools_dir.is_none());
        assert!(config.max_attempts.is_none());
    }

    // ---- merging ----

    #[test]
    fn test_config_merge_takes_other_values() {
        let mut base = Config::default();
        let other = Config {
            port: Some("/dev/ttyACM0".to_string()),
            board: Some("Yun".to_string()),
            max_attempts: Some(2),
            ..Config::default()
        };

        base.merge(other);

        assert_eq!(base.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(base.board.as_deref(), Some("Yun"));
        assert_eq!(base.max_attempts, Some(2));
    }

    #[test]
    fn test_config_merge_overrides_existing() {
        let mut base = Config {
            port: Some("/dev/ttyACM0".to_string()),
            max_attempts: Some(4),
            ..Config::default()
        };
        let other = Config {
            port: Some("/dev/ttyACM1".to_string()),
            ..Config::default()
        };

        base.merge(other);

        assert_eq!(base.port.as_deref(), Some("/dev/ttyACM1"));
        // Fields absent in the other config stay untouched.
        assert_eq!(base.max_attempts, Some(4));
    }

    #[test]
    fn test_merge_ignores_unset_fields() {
        let mut base = Config {
            port: Some("/dev/ttyACM0".to_string()),
            board: Some("Tian".to_string()),
            ..Config::default()
        };

        base.merge(Config::default()); // all None

        assert_eq!(base.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(base.board.as_deref(), Some("Tian"));
    }

    // ---- TOML parsing ----

    #[test]
    fn test_parse_full_file() {
        let toml_str = r#"
port = "/dev/ttyACM0"
board = "Yun"
firmware_dir = "/srv/tftp"
tools_dir = "/opt/avr"
max_attempts = 6
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.board.as_deref(), Some("Yun"));
        assert_eq!(
            config.firmware_dir.as_deref(),
            Some(Path::new("/srv/tftp"))
        );
        assert_eq!(config.tools_dir.as_deref(), Some(Path::new("/opt/avr")));
        assert_eq!(config.max_attempts, Some(6));
    }

    #[test]
    fn test_parse_empty_file() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.port.is_none());
        assert!(config.board.is_none());
        assert!(config.max_attempts.is_none());
    }

    #[test]
    fn test_parse_partial_file() {
        let config: Config = toml::from_str("board = \"Tian\"\n").unwrap();
        assert!(config.port.is_none());
        assert_eq!(config.board.as_deref(), Some("Tian"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config {
            port: Some("COM3".to_string()),
            board: Some("Yun Mini".to_string()),
            firmware_dir: Some(PathBuf::from("tftp")),
            tools_dir: None,
            max_attempts: Some(1),
        };

        let serialized = toml::to_string_pretty(&config).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();

        assert_eq!(deserialized.port.as_deref(), Some("COM3"));
        assert_eq!(deserialized.board.as_deref(), Some("Yun Mini"));
        assert_eq!(deserialized.firmware_dir.as_deref(), Some(Path::new("tftp")));
        assert!(deserialized.tools_dir.is_none());
        assert_eq!(deserialized.max_attempts, Some(1));
    }

    // ---- file loading ----

    #[test]
    fn test_load_from_path_reads_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test_config.toml");
        fs::write(
            &path,
            r#"
port = "/dev/ttyACM1"
max_attempts = 3
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.port.as_deref(), Some("/dev/ttyACM1"));
        assert_eq!(config.max_attempts, Some(3));
    }

    #[test]
    fn test_load_from_path_missing_file_gives_defaults() {
        let config = Config::load_from_path(Path::new("/nonexistent/path/config.toml"));
        assert!(config.port.is_none());
    }

    #[test]
    fn test_load_from_path_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "port = [[[").unwrap();

        let config = Config::load_from_path(&path);
        assert!(config.port.is_none());
    }

    // ---- global path ----

    #[test]
    fn test_global_path_is_per_user_config_toml() {
        // None only on platforms without a home directory.
        if let Some(p) = Config::global_config_path() {
            assert!(p.to_str().unwrap().contains("yunflash"));
            assert!(p.to_str().unwrap().ends_with("config.toml"));
        }
    }
}
