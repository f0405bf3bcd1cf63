use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::api::{CustomAction, HttpQueue, JsonApi, DEFAULT_CONCURRENCY};
use crate::store::{define_api_store, define_single_api_store, StoreDefinition, StoreOptions};

/// Environment variable holding the bearer token the CLI sends.
pub const API_TOKEN_VAR: &str = "CLOCKVINE_API_TOKEN";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Named store definitions
  #[serde(default)]
  pub stores: BTreeMap<String, StoreConfig>,
  /// Requests allowed in flight at once, shared by every store
  #[serde(default = "default_concurrency")]
  pub concurrency: usize,
  /// Static headers sent with every request
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  /// Sent as `X-XSRF-TOKEN` with every request
  pub xsrf_token: Option<String>,
  /// Base URL that relative store URLs resolve against
  pub origin: Option<String>,
}

fn default_concurrency() -> usize {
  DEFAULT_CONCURRENCY
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
  /// Endpoint URL or URL template, e.g. `/api/users/:id?`
  pub url: String,
  /// A single resource rather than a collection
  #[serde(default)]
  pub singleton: bool,
  #[serde(flatten)]
  pub options: StoreOptions,
  #[serde(default)]
  pub actions: BTreeMap<String, CustomAction>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./clockvine.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/clockvine/config.yaml
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
        "No configuration file found. Create one at ~/.config/clockvine/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("clockvine.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("clockvine").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  pub fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Get the API bearer token from the environment, if set.
  pub fn api_token() -> Option<String> {
    std::env::var(API_TOKEN_VAR)
      .ok()
      .filter(|token| !token.is_empty())
  }

  /// Build the store named `name`. Every store built from one call to
  /// [`queue`](Self::queue) shares its concurrency limit.
  pub fn definition(&self, name: &str, queue: &HttpQueue, token: Option<&str>) -> Result<StoreDefinition> {
    let store = self
      .stores
      .get(name)
      .ok_or_else(|| eyre!("No store named {} in configuration", name))?;

    let mut api = if store.singleton {
      JsonApi::singleton(&store.url)?
    } else {
      JsonApi::new(&store.url)?.with_id_field(&store.options.id_field)
    }
    .with_queue(queue.clone());

    if let Some(origin) = &self.origin {
      api = api.with_origin(origin)?;
    }
    for (header, value) in &self.headers {
      api = api.with_header(header, value)?;
    }
    if let Some(token) = &self.xsrf_token {
      api = api.with_xsrf_token(token)?;
    }
    if let Some(token) = token {
      api = api.with_bearer_token(token)?;
    }

    let api = std::sync::Arc::new(api);
    let mut definition = if store.singleton {
      define_single_api_store(name, api, store.options.clone())?
    } else {
      define_api_store(name, api, store.options.clone())?
    };
    for (action_name, action) in &store.actions {
      definition = definition.with_action(action_name, action.clone())?;
    }
    Ok(definition)
  }

  /// The request queue every store of this configuration shares.
  pub fn queue(&self) -> HttpQueue {
    HttpQueue::new(self.concurrency)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::ApiAction;

  const EXAMPLE: &str = r#"
origin: https://example.com
concurrency: 4
xsrf_token: abc123
headers:
  X-Client: clockvine
stores:
  users:
    url: /api/users/:id?
    id_field: uuid
    actions:
      publish:
        api_action: post
        url: /api/users/:uuid/publish
        invalidate_indexes: true
  me:
    url: /api/me
    singleton: true
"#;

  #[test]
  fn test_parse_config() {
    let config = Config::parse(EXAMPLE).unwrap();
    assert_eq!(config.concurrency, 4);
    assert_eq!(config.xsrf_token.as_deref(), Some("abc123"));

    let users = &config.stores["users"];
    assert_eq!(users.options.id_field, "uuid");
    assert_eq!(users.options.index_data_field, "data");
    assert!(!users.singleton);
    assert_eq!(users.actions["publish"].api_action, ApiAction::Store);
    assert!(config.stores["me"].singleton);
  }

  #[test]
  fn test_defaults() {
    let config = Config::parse("stores: {}").unwrap();
    assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
    assert!(config.headers.is_empty());
    assert!(config.origin.is_none());
  }

  #[test]
  fn test_definition_from_config() {
    let config = Config::parse(EXAMPLE).unwrap();
    let queue = config.queue();
    assert_eq!(queue.concurrency(), 4);

    let users = config.definition("users", &queue, Some("token")).unwrap();
    assert_eq!(users.name(), "users");
    assert_eq!(users.options().id_field, "uuid");
    assert_eq!(users.instance().action_names(), vec!["publish"]);

    let me = config.definition("me", &queue, None).unwrap();
    assert!(!me.options().show_requires_key);

    assert!(config.definition("missing", &queue, None).is_err());
  }

  #[test]
  fn test_missing_explicit_path() {
    let err = Config::load(Some(Path::new("/nonexistent/clockvine.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
