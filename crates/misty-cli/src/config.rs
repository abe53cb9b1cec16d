//! Configuration Vault – reads/writes `~/.misty/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Failed to write config at {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Persisted user configuration stored in `~/.misty/config.toml`.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Robot address (host or host:port) for both REST and push channels.
    #[serde(default = "default_robot_ip")]
    pub robot_ip: String,

    /// wit.ai server access token used by question answering.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub wit_ai_key: String,

    /// Where question answering archives fetched recordings.
    #[serde(default = "default_recordings_dir")]
    pub recordings_dir: PathBuf,

    /// Server-side debounce requested in every subscribe frame.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Messages and errors kept per subscription.
    #[serde(default = "default_history_len")]
    pub history_len: usize,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("robot_ip", &self.robot_ip)
            .field(
                "wit_ai_key",
                if self.wit_ai_key.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("recordings_dir", &self.recordings_dir)
            .field("debounce_ms", &self.debounce_ms)
            .field("history_len", &self.history_len)
            .finish()
    }
}

fn default_robot_ip() -> String {
    "192.168.0.103".to_string()
}
fn default_recordings_dir() -> PathBuf {
    misty_home().join("recordings")
}
fn default_debounce_ms() -> u64 {
    misty_middleware::subscription::DEFAULT_DEBOUNCE_MS
}
fn default_history_len() -> usize {
    misty_middleware::subscription::DEFAULT_MAX_ENTRIES
}

impl Default for Config {
    fn default() -> Self {
        Self {
            robot_ip: default_robot_ip(),
            wit_ai_key: String::new(),
            recordings_dir: default_recordings_dir(),
            debounce_ms: default_debounce_ms(),
            history_len: default_history_len(),
        }
    }
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn misty_home() -> PathBuf {
    PathBuf::from(home_dir()).join(".misty")
}

/// Return the path to `~/.misty/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".misty").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, ConfigError> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(toml::from_str(&raw)?))
}

/// Apply `MISTY_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `MISTY_IP` | `robot_ip` |
/// | `MISTY_WIT_AI_KEY` | `wit_ai_key` |
/// | `MISTY_RECORDINGS_DIR` | `recordings_dir` |
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |name| std::env::var(name).ok());
}

pub(crate) fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("MISTY_IP").filter(|v| !v.is_empty()) {
        cfg.robot_ip = v;
    }
    if let Some(v) = lookup("MISTY_WIT_AI_KEY") {
        cfg.wit_ai_key = v;
    }
    if let Some(v) = lookup("MISTY_RECORDINGS_DIR").filter(|v| !v.is_empty()) {
        cfg.recordings_dir = PathBuf::from(v);
    }
}

/// Save the config to disk, creating `~/.misty/` if necessary.
pub fn save(cfg: &Config) -> Result<(), ConfigError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    let write_err = |source: std::io::Error| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
        // Owner-only config directory (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(write_err)?;
        }
    }
    let raw = toml::to_string_pretty(cfg)?;
    // The wit.ai key is stored in plain text: rw------- on Unix.
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn debug_redacts_wit_key() {
        let cfg = Config {
            wit_ai_key: "wit-super-secret".to_string(),
            ..Config::default()
        };
        let debug_str = format!("{:?}", cfg);
        assert!(!debug_str.contains("wit-super-secret"), "key must not appear in debug output");
        assert!(debug_str.contains("<redacted>"));
        assert!(format!("{:?}", Config::default()).contains("<not set>"));
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().expect("tmp dir");
        assert!(load_from(&dir.path().join("config.toml")).expect("load").is_none());
    }

    #[test]
    fn partial_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "robot_ip = \"10.0.0.7\"\n").expect("write");

        let cfg = load_from(&path).expect("load").expect("present");
        assert_eq!(cfg.robot_ip, "10.0.0.7");
        assert_eq!(cfg.debounce_ms, 250);
        assert_eq!(cfg.history_len, 10);
        assert!(cfg.wit_ai_key.is_empty());
    }

    #[test]
    fn invalid_toml_is_parse_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "robot_ip = [").expect("write");
        assert!(matches!(load_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn save_then_load_preserves_fields() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        let cfg = Config {
            robot_ip: "10.0.0.9".to_string(),
            wit_ai_key: "k".to_string(),
            recordings_dir: dir.path().join("rec"),
            debounce_ms: 500,
            history_len: 3,
        };

        save_to(&cfg, &path).expect("save");
        assert_eq!(load_from(&path).expect("load"), Some(cfg));
    }

    #[test]
    fn env_overrides_replace_fields() {
        let vars: HashMap<&str, &str> = [
            ("MISTY_IP", "10.1.1.1"),
            ("MISTY_WIT_AI_KEY", "from-env"),
            ("MISTY_RECORDINGS_DIR", "/tmp/rec"),
        ]
        .into();
        let mut cfg = Config::default();

        apply_overrides(&mut cfg, |name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(cfg.robot_ip, "10.1.1.1");
        assert_eq!(cfg.wit_ai_key, "from-env");
        assert_eq!(cfg.recordings_dir, PathBuf::from("/tmp/rec"));
    }

    #[test]
    fn empty_ip_override_is_ignored() {
        let mut cfg = Config::default();
        apply_overrides(&mut cfg, |name| (name == "MISTY_IP").then(String::new));
        assert_eq!(cfg.robot_ip, default_robot_ip());
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");
        let dir_mode = fs::metadata(path.parent().unwrap())
            .expect("dir metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700, "config directory must have 0o700 permissions");
    }
}
