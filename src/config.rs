use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides `store.data_dir`.
pub const DATA_DIR_ENV: &str = "RANGECACHE_DATA_DIR";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub store: StoreConfig,
  #[serde(default)]
  pub writer: WriterConfig,
  #[serde(default)]
  pub key_value: KeyValueConfig,
  #[serde(default)]
  pub http: HttpConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
  /// Directory holding one SQLite file per store (defaults to the user data dir)
  pub data_dir: Option<PathBuf>,
  /// Keep every store in memory; nothing survives the process
  #[serde(default)]
  pub in_memory: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
  /// Quiet period after the last enqueue before queued writes are flushed
  #[serde(default = "default_writer_delay_ms")]
  pub delay_ms: u64,
  /// When false, writes only happen on an explicit flush
  #[serde(default = "default_true")]
  pub automatic: bool,
}

impl Default for WriterConfig {
  fn default() -> Self {
    Self {
      delay_ms: default_writer_delay_ms(),
      automatic: true,
    }
  }
}

impl WriterConfig {
  pub fn delay(&self) -> Duration {
    Duration::from_millis(self.delay_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyValueConfig {
  /// Lifetime of a key/value entry
  #[serde(default = "default_expiration_secs")]
  pub expiration_secs: u64,
}

impl Default for KeyValueConfig {
  fn default() -> Self {
    Self {
      expiration_secs: default_expiration_secs(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpConfig {
  /// Origin prepended to relative request urls (e.g. "https://perf.example.com")
  pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
  /// Default filter directive when RANGECACHE_LOG is unset
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Write logs to daily-rolling files in this directory instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      directory: None,
    }
  }
}

fn default_writer_delay_ms() -> u64 {
  3000
}

fn default_expiration_secs() -> u64 {
  20 * 60 * 60
}

fn default_log_level() -> String {
  "info".to_string()
}

fn default_true() -> bool {
  true
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./rangecache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/rangecache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/rangecache/config.yaml"
      )),
    }
  }

  /// Like [`Config::load`] without an explicit path, but falls back to defaults when no
  /// file exists. A file that exists and fails to parse is still an error.
  pub fn load_or_default() -> Result<Self> {
    match Self::find_config_file() {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default().with_env_overrides()),
    }
  }

  /// Defaults suitable for tests: in-memory stores and manual flushing.
  pub fn ephemeral() -> Self {
    Self {
      store: StoreConfig {
        data_dir: None,
        in_memory: true,
      },
      writer: WriterConfig {
        automatic: false,
        ..WriterConfig::default()
      },
      ..Self::default()
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("rangecache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("rangecache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  /// Parse configuration from a YAML document and apply environment overrides.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config.with_env_overrides())
  }

  fn with_env_overrides(mut self) -> Self {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
      if !dir.is_empty() {
        self.store.data_dir = Some(PathBuf::from(dir));
      }
    }
    self
  }

  /// Directory where on-disk stores live.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.store.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("rangecache").join("stores"))
  }
}
