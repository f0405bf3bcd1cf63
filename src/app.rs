use crate::event::{Event, EventHandler};
use clap::Subcommand;
use clockvine::api::HttpQueue;
use clockvine::config::Config;
use clockvine::{ApiStore, FetchState, Index, Params};
use color_eyre::{eyre::eyre, Result};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, info};

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
  /// List the stores defined in the configuration
  Stores,
  /// Fetch one page of a store's index
  Index {
    /// Store name
    store: String,
    /// Index parameter as key=value (repeatable)
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, Value)>,
  },
  /// Fetch one element by id
  Show {
    /// Store name
    store: String,
    /// Element id
    id: String,
  },
  /// Print an index, then print it again whenever it changes
  Watch {
    /// Store name
    store: String,
    /// Index parameter as key=value (repeatable)
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, Value)>,
    /// Seconds between revalidations
    #[arg(long, default_value_t = 5)]
    interval: u64,
  },
}

/// Parse `key=value`. The value is read as JSON when it parses, so
/// `page=2` sends a number and `name=Kevin` a string.
fn parse_param(raw: &str) -> Result<(String, Value), String> {
  let (key, value) = raw
    .split_once('=')
    .ok_or_else(|| format!("expected key=value, got {}", raw))?;
  if key.is_empty() {
    return Err(format!("empty parameter name in {}", raw));
  }
  Ok((key.to_string(), scalar(value)))
}

fn scalar(raw: &str) -> Value {
  serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Main application state
pub struct App {
  /// Application configuration
  config: Config,

  /// Request queue shared by every store
  queue: HttpQueue,

  /// Bearer token from the environment
  token: Option<String>,
}

impl App {
  pub fn new(config: Config) -> Self {
    let queue = config.queue();
    Self {
      config,
      queue,
      token: Config::api_token(),
    }
  }

  pub async fn run(&self, command: Command) -> Result<()> {
    match command {
      Command::Stores => {
        for line in self.store_lines() {
          println!("{}", line);
        }
        Ok(())
      }
      Command::Index { store, params } => {
        let store = self.store(&store)?;
        let index = store
          .index(params_from(params))
          .load()
          .await?
          .ok_or_else(|| eyre!("Store {} returned no index", store.name()))?;
        print_json(&index_json(&index, &store.options().index_data_field))
      }
      Command::Show { store, id } => {
        let store = self.store(&store)?;
        let entity = store
          .show(scalar(&id))
          .load()
          .await?
          .ok_or_else(|| eyre!("{} {} not found", store.name(), id))?;
        print_json(&entity.to_value())
      }
      Command::Watch {
        store,
        params,
        interval,
      } => {
        let store = self.store(&store)?;
        self.watch(store, params_from(params), Duration::from_secs(interval.max(1))).await
      }
    }
  }

  fn store(&self, name: &str) -> Result<ApiStore> {
    let definition = self
      .config
      .definition(name, &self.queue, self.token.as_deref())?;
    Ok(definition.instance())
  }

  fn store_lines(&self) -> Vec<String> {
    self
      .config
      .stores
      .iter()
      .map(|(name, store)| {
        let kind = if store.singleton { "singleton" } else { "collection" };
        let actions: Vec<&str> = store.actions.keys().map(String::as_str).collect();
        if actions.is_empty() {
          format!("{}\t{}\t{}", name, kind, store.url)
        } else {
          format!("{}\t{}\t{}\t[{}]", name, kind, store.url, actions.join(", "))
        }
      })
      .collect()
  }

  async fn watch(&self, store: ApiStore, params: Params, interval: Duration) -> Result<()> {
    let handle = store.index(params.clone());
    let data_field = store.options().index_data_field.clone();
    let mut events = EventHandler::new(interval);
    let mut last = None;
    let mut last_error = None;

    info!(store = %store.name(), key = %handle.key(), "Watching index");

    loop {
      // A failed slot refetches on the next read, so hold reads until a tick.
      let failure = handle
        .status()
        .filter(|status| status.state == FetchState::Invalid)
        .and_then(|status| status.error);

      match &failure {
        Some(error) => {
          if last_error.as_ref() != Some(error) {
            eprintln!("Error: {}", error);
            last_error = Some(error.clone());
          }
        }
        None => {
          last_error = None;
          if let Some(index) = handle.get() {
            let rendered = index_json(&index, &data_field);
            if last.as_ref() != Some(&rendered) {
              print_json(&rendered)?;
              last = Some(rendered);
            }
          }
        }
      }

      tokio::select! {
        event = events.next() => match event {
          Some(Event::Tick) if failure.is_some() => {
            debug!(store = %store.name(), "Retrying index");
            handle.get();
          }
          Some(Event::Tick) => {
            debug!(store = %store.name(), "Revalidating index");
            store.invalidate_index(&params);
          }
          Some(Event::Quit) | None => break,
        },
        _ = handle.changed(), if failure.is_none() => {}
      }
    }

    Ok(())
  }
}

fn params_from(pairs: Vec<(String, Value)>) -> Params {
  pairs
    .into_iter()
    .fold(Params::new(), |params, (key, value)| params.with(key, value))
}

/// The index envelope with the data member replaced by the current
/// entity values.
fn index_json(index: &Index, data_field: &str) -> Value {
  let mut envelope: Map<String, Value> = index.fields().clone();
  envelope.insert(
    data_field.to_string(),
    Value::Array(index.data().iter().map(|entity| entity.to_value()).collect()),
  );
  Value::Object(envelope)
}

fn print_json(value: &Value) -> Result<()> {
  let text =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to render response: {}", e))?;
  println!("{}", text);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use clockvine::{define_api_store, MemoryApi, StoreOptions};
  use serde_json::json;
  use std::sync::Arc;

  #[test]
  fn test_parse_param() {
    assert_eq!(parse_param("page=2").unwrap(), ("page".into(), json!(2)));
    assert_eq!(parse_param("name=Kevin").unwrap(), ("name".into(), json!("Kevin")));
    assert_eq!(parse_param("q=a=b").unwrap(), ("q".into(), json!("a=b")));
    assert!(parse_param("page").is_err());
    assert!(parse_param("=2").is_err());
  }

  #[test]
  fn test_store_lines() {
    let config = Config::parse(
      r#"
stores:
  users:
    url: /api/users
    actions:
      publish:
        api_action: post
  me:
    url: /api/me
    singleton: true
"#,
    )
    .unwrap();
    let app = App::new(config);
    assert_eq!(
      app.store_lines(),
      vec![
        "me\tsingleton\t/api/me".to_string(),
        "users\tcollection\t/api/users\t[publish]".to_string(),
      ]
    );
  }

  #[tokio::test]
  async fn test_index_json_uses_current_entities() {
    let api = Arc::new(MemoryApi::seeded([json!({"id": 1, "name": "Kevin"})]));
    let store = define_api_store("users", api, StoreOptions::default())
      .unwrap()
      .instance();
    let handle = store.index(params_from(vec![("page".into(), json!(1))]));
    let index = handle.load().await.unwrap().unwrap();

    store.update(json!({"id": 1, "name": "Chuck"})).await.unwrap();

    let rendered = index_json(&index, "data");
    assert_eq!(rendered["data"][0]["name"], json!("Chuck"));
    assert_eq!(rendered["meta"]["current_page"], json!(1));
  }
}
