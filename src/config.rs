use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::cache::{CollectionPolicy, CollectionRegistry, Shape};
use crate::community::default_collections;
use crate::engine::EngineOptions;
use crate::storage::SqliteStore;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  /// Per-collection overrides of the built-in policies
  #[serde(default)]
  pub collections: BTreeMap<String, CollectionOverride>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
  /// Database file (defaults to $XDG_DATA_HOME/koinonia/cache.db)
  pub path: Option<PathBuf>,
  /// Upper bound on persisted bytes, like browser local storage
  #[serde(default = "default_quota_bytes")]
  pub quota_bytes: u64,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      path: None,
      quota_bytes: default_quota_bytes(),
    }
  }
}

fn default_quota_bytes() -> u64 {
  5 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_ttl_secs")]
  pub ttl_secs: u64,
  #[serde(default = "default_volatile_after_secs")]
  pub volatile_after_secs: u64,
  #[serde(default = "default_persist_debounce_ms")]
  pub persist_debounce_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: default_ttl_secs(),
      volatile_after_secs: default_volatile_after_secs(),
      persist_debounce_ms: default_persist_debounce_ms(),
    }
  }
}

fn default_ttl_secs() -> u64 {
  7 * 24 * 60 * 60
}

fn default_volatile_after_secs() -> u64 {
  30 * 60
}

fn default_persist_debounce_ms() -> u64 {
  1000
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ShapeName {
  List,
  Detail,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct CollectionOverride {
  pub stale_after_secs: Option<u64>,
  pub volatile: Option<bool>,
  pub shape: Option<ShapeName>,
  /// Only meaningful for detail collections
  pub borrow_from: Option<Vec<String>>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./koinonia.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/koinonia/config.yaml
  ///
  /// Without a file every setting takes its default.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("koinonia.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("koinonia").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  /// Parse YAML text. An empty document yields the defaults.
  pub fn parse(contents: &str) -> Result<Self> {
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.collections()?;
    Ok(config)
  }

  /// Where the durable cache lives.
  pub fn storage_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(path) => Ok(path.clone()),
      None => SqliteStore::default_path(),
    }
  }

  pub fn engine_options(&self) -> Result<EngineOptions> {
    Ok(EngineOptions {
      ttl: seconds("cache.ttl_secs", self.cache.ttl_secs)?,
      volatile_after: seconds("cache.volatile_after_secs", self.cache.volatile_after_secs)?,
      persist_debounce: std::time::Duration::from_millis(self.cache.persist_debounce_ms),
    })
  }

  /// Built-in community policies with the configured overrides applied.
  pub fn collections(&self) -> Result<CollectionRegistry> {
    let mut registry = default_collections();
    for (name, over) in &self.collections {
      let policy = over
        .apply(registry.get(name).clone())
        .map_err(|e| eyre!("collections.{}: {}", name, e))?;
      registry.insert(name, policy);
    }
    Ok(registry)
  }
}

impl CollectionOverride {
  fn apply(&self, mut policy: CollectionPolicy) -> Result<CollectionPolicy> {
    if let Some(secs) = self.stale_after_secs {
      policy.stale_after = seconds("stale_after_secs", secs)?;
    }
    if let Some(volatile) = self.volatile {
      policy.volatile = volatile;
    }

    let shape = self.shape.unwrap_or(match policy.shape {
      Shape::List => ShapeName::List,
      Shape::Detail { .. } => ShapeName::Detail,
    });
    policy.shape = match (shape, &self.borrow_from, policy.shape) {
      (ShapeName::List, Some(_), _) => {
        return Err(eyre!("borrow_from requires shape: detail"));
      }
      (ShapeName::List, None, _) => Shape::List,
      (ShapeName::Detail, Some(from), _) => Shape::Detail {
        borrow_from: from.clone(),
      },
      (ShapeName::Detail, None, Shape::Detail { borrow_from }) => Shape::Detail { borrow_from },
      (ShapeName::Detail, None, Shape::List) => Shape::Detail {
        borrow_from: Vec::new(),
      },
    };
    Ok(policy)
  }
}

fn seconds(field: &str, secs: u64) -> Result<Duration> {
  i64::try_from(secs)
    .ok()
    .and_then(Duration::try_seconds)
    .ok_or_else(|| eyre!("{} is out of range: {}", field, secs))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::community::{BIBLE, PRAYERS_DETAIL, PRAYERS_LIST};

  #[test]
  fn test_empty_document_uses_defaults() {
    let config = Config::parse("").unwrap();
    assert_eq!(config.storage.quota_bytes, 5 * 1024 * 1024);

    let options = config.engine_options().unwrap();
    assert_eq!(options, EngineOptions::default());
  }

  #[test]
  fn test_partial_sections_keep_other_defaults() {
    let config = Config::parse(
      r#"
storage:
  path: /tmp/koinonia-test.db
cache:
  ttl_secs: 60
"#,
    )
    .unwrap();

    assert_eq!(
      config.storage_path().unwrap(),
      PathBuf::from("/tmp/koinonia-test.db")
    );
    assert_eq!(config.storage.quota_bytes, default_quota_bytes());
    let options = config.engine_options().unwrap();
    assert_eq!(options.ttl, Duration::seconds(60));
    assert_eq!(options.volatile_after, Duration::minutes(30));
  }

  #[test]
  fn test_collection_overrides() {
    let config = Config::parse(
      r#"
collections:
  prayers.list:
    stale_after_secs: 10
    volatile: false
  notes:
    shape: detail
    borrow_from: [prayers.list]
"#,
    )
    .unwrap();
    let registry = config.collections().unwrap();

    let list = registry.get(PRAYERS_LIST);
    assert_eq!(list.stale_after, Duration::seconds(10));
    assert!(!list.volatile);
    assert_eq!(list.shape, Shape::List);

    assert_eq!(
      registry.get("notes").shape,
      Shape::Detail {
        borrow_from: vec![PRAYERS_LIST.to_string()]
      }
    );
    // Untouched built-ins survive
    assert_eq!(registry.get(BIBLE).stale_after, Duration::hours(24));
    assert!(matches!(registry.get(PRAYERS_DETAIL).shape, Shape::Detail { .. }));
  }

  #[test]
  fn test_borrow_from_on_list_is_rejected() {
    let err = Config::parse(
      r#"
collections:
  bible:
    shape: list
    borrow_from: [prayers.list]
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("collections.bible"));
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/nonexistent/koinonia.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_load_from_file() {
    let path = std::env::temp_dir().join(format!("koinonia-config-{}.yaml", std::process::id()));
    std::fs::write(&path, "cache:\n  volatile_after_secs: 120\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(
      config.engine_options().unwrap().volatile_after,
      Duration::minutes(2)
    );
  }
}
