//! URL templates and per-action URL formatting.
//!
//! Templates use a small path-to-regexp style syntax:
//!
//! - `:name` is a required parameter, `:name?` an optional one. When an
//!   optional parameter is absent, a `/` or `.` directly before it is dropped
//!   too.
//! - `{ ... }?` is an optional group, dropped whole if any parameter inside is
//!   missing, e.g. `/api/users/{:id.json}?`.
//!
//! Parameters come from the query parameters first, then from the request
//! payload. Query parameters used in the path leave the query string; the
//! remaining non-null ones are appended sorted by name.

use color_eyre::Result;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use super::ApiAction;
use crate::error::StoreError;
use crate::params::{canonical_query, scalar_string};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
  Literal(String),
  Param {
    name: String,
    prefix: String,
    optional: bool,
  },
  Group {
    tokens: Vec<Token>,
    prefix: String,
    optional: bool,
  },
}

/// A parsed URL template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
  pattern: String,
  tokens: Vec<Token>,
}

impl UrlTemplate {
  pub fn parse(pattern: &str) -> Result<Self> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut pos = 0;
    let tokens =
      parse_tokens(&chars, &mut pos, false).map_err(|reason| StoreError::InvalidTemplate {
        template: pattern.to_string(),
        reason,
      })?;

    Ok(Self {
      pattern: pattern.to_string(),
      tokens,
    })
  }

  pub fn pattern(&self) -> &str {
    &self.pattern
  }

  /// Names of every parameter in the template, in order of appearance.
  pub fn param_names(&self) -> Vec<&str> {
    let mut names = Vec::new();
    collect_names(&self.tokens, &mut names);
    names
  }

  pub fn has_params(&self) -> bool {
    !self.param_names().is_empty()
  }
}

fn collect_names<'a>(tokens: &'a [Token], names: &mut Vec<&'a str>) {
  for token in tokens {
    match token {
      Token::Literal(_) => {}
      Token::Param { name, .. } => names.push(name),
      Token::Group { tokens, .. } => collect_names(tokens, names),
    }
  }
}

fn parse_tokens(chars: &[char], pos: &mut usize, in_group: bool) -> Result<Vec<Token>, String> {
  let mut tokens = Vec::new();
  let mut literal = String::new();

  while *pos < chars.len() {
    match chars[*pos] {
      '{' => {
        let start = *pos;
        *pos += 1;
        let inner = parse_tokens(chars, pos, true)?;
        if inner.is_empty() {
          return Err(format!("empty group at {}", start));
        }
        let optional = take_optional(chars, pos);
        let prefix = split_prefix(&mut literal, optional);
        flush(&mut literal, &mut tokens);
        tokens.push(Token::Group {
          tokens: inner,
          prefix,
          optional,
        });
      }
      '}' if in_group => {
        *pos += 1;
        flush(&mut literal, &mut tokens);
        return Ok(tokens);
      }
      '}' => return Err(format!("unmatched '}}' at {}", *pos)),
      ':' if chars
        .get(*pos + 1)
        .is_some_and(|next| next.is_ascii_alphabetic() || *next == '_') =>
      {
        *pos += 1;
        let mut name = String::new();
        while let Some(&next) = chars.get(*pos) {
          if next.is_ascii_alphanumeric() || next == '_' {
            name.push(next);
            *pos += 1;
          } else {
            break;
          }
        }
        let optional = take_optional(chars, pos);
        let prefix = split_prefix(&mut literal, optional);
        flush(&mut literal, &mut tokens);
        tokens.push(Token::Param {
          name,
          prefix,
          optional,
        });
      }
      other => {
        literal.push(other);
        *pos += 1;
      }
    }
  }

  if in_group {
    return Err("unclosed '{'".to_string());
  }
  flush(&mut literal, &mut tokens);
  Ok(tokens)
}

fn take_optional(chars: &[char], pos: &mut usize) -> bool {
  if chars.get(*pos) == Some(&'?') {
    *pos += 1;
    true
  } else {
    false
  }
}

/// Optional parts carry the separator before them so it disappears with them.
fn split_prefix(literal: &mut String, optional: bool) -> String {
  if optional && (literal.ends_with('/') || literal.ends_with('.')) {
    literal.pop().map(String::from).unwrap_or_default()
  } else {
    String::new()
  }
}

fn flush(literal: &mut String, tokens: &mut Vec<Token>) {
  if !literal.is_empty() {
    tokens.push(Token::Literal(std::mem::take(literal)));
  }
}

/// Parameter lookup: query parameters shadow payload fields.
struct Values<'a> {
  params: &'a Map<String, Value>,
  payload: Option<&'a Map<String, Value>>,
}

impl Values<'_> {
  /// The rendered value and whether it came from the query parameters.
  fn lookup(&self, name: &str) -> Option<(String, bool)> {
    let present = |value: &Value| scalar_string(value).filter(|s| !s.is_empty());

    if let Some(value) = self.params.get(name).and_then(present) {
      return Some((value, true));
    }
    self
      .payload
      .and_then(|payload| payload.get(name))
      .and_then(present)
      .map(|value| (value, false))
  }
}

/// Render `tokens` into `out`. On failure returns the missing parameter.
fn render_tokens(
  tokens: &[Token],
  values: &Values<'_>,
  out: &mut String,
  used: &mut BTreeSet<String>,
) -> Result<(), String> {
  for token in tokens {
    match token {
      Token::Literal(text) => out.push_str(text),
      Token::Param {
        name,
        prefix,
        optional,
      } => match values.lookup(name) {
        Some((value, from_params)) => {
          out.push_str(prefix);
          out.push_str(&encode_segment(&value));
          if from_params {
            used.insert(name.clone());
          }
        }
        None if *optional => {}
        None => return Err(name.clone()),
      },
      Token::Group {
        tokens,
        prefix,
        optional,
      } => {
        let mut inner = String::new();
        let mut inner_used = BTreeSet::new();
        match render_tokens(tokens, values, &mut inner, &mut inner_used) {
          Ok(()) => {
            out.push_str(prefix);
            out.push_str(&inner);
            used.extend(inner_used);
          }
          Err(_) if *optional => {}
          Err(missing) => return Err(missing),
        }
      }
    }
  }
  Ok(())
}

/// Percent-encode one path segment, keeping RFC 3986 unreserved characters.
fn encode_segment(value: &str) -> String {
  let mut out = String::with_capacity(value.len());
  for byte in value.bytes() {
    match byte {
      b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => out.push(byte as char),
      _ => {
        let _ = write!(out, "%{:02X}", byte);
      }
    }
  }
  out
}

/// How a formatter treats ids and actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UrlIntent {
  /// A collection: element actions address `/{id}` under the base URL
  #[default]
  Collection,
  /// A single resource: one URL for every action, ids are ignored
  Singleton,
}

/// Builds request URLs for each [`ApiAction`].
#[derive(Debug, Clone)]
pub struct UrlFormatter {
  intent: UrlIntent,
  default: UrlTemplate,
  templates: BTreeMap<ApiAction, UrlTemplate>,
  id_field: String,
}

impl UrlFormatter {
  /// Formatter for a collection resource.
  pub fn new(pattern: &str) -> Result<Self> {
    Ok(Self {
      intent: UrlIntent::Collection,
      default: UrlTemplate::parse(pattern)?,
      templates: BTreeMap::new(),
      id_field: "id".to_string(),
    })
  }

  /// Formatter for a singleton resource.
  pub fn singleton(pattern: &str) -> Result<Self> {
    Ok(Self {
      intent: UrlIntent::Singleton,
      ..Self::new(pattern)?
    })
  }

  /// Use a different template for one action.
  pub fn with_template(mut self, action: ApiAction, pattern: &str) -> Result<Self> {
    self.templates.insert(action, UrlTemplate::parse(pattern)?);
    Ok(self)
  }

  pub fn with_id_field(mut self, id_field: impl Into<String>) -> Self {
    self.id_field = id_field.into();
    self
  }

  pub fn intent(&self) -> UrlIntent {
    self.intent
  }

  pub fn id_field(&self) -> &str {
    &self.id_field
  }

  pub fn template(&self, action: ApiAction) -> &UrlTemplate {
    self.templates.get(&action).unwrap_or(&self.default)
  }

  pub fn format(
    &self,
    action: ApiAction,
    params: &Map<String, Value>,
    payload: Option<&Map<String, Value>>,
  ) -> Result<String> {
    self.format_with(self.template(action), action, params, payload)
  }

  /// Format with an explicit template, e.g. a custom action's URL.
  pub fn format_with(
    &self,
    template: &UrlTemplate,
    action: ApiAction,
    params: &Map<String, Value>,
    payload: Option<&Map<String, Value>>,
  ) -> Result<String> {
    let values = Values { params, payload };
    let mut path = String::new();
    let mut used = BTreeSet::new();

    render_tokens(&template.tokens, &values, &mut path, &mut used).map_err(|param| {
      StoreError::MissingUrlParam {
        template: template.pattern.clone(),
        param,
      }
    })?;

    // A plain base URL addresses elements as `{base}/{id}`.
    if self.intent == UrlIntent::Collection && action.targets_element() && !template.has_params()
    {
      let (id, from_params) =
        values
          .lookup(&self.id_field)
          .ok_or_else(|| StoreError::MissingUrlParam {
            template: template.pattern.clone(),
            param: self.id_field.clone(),
          })?;
      path = format!("{}/{}", path.trim_end_matches('/'), encode_segment(&id));
      if from_params {
        used.insert(self.id_field.clone());
      }
    }

    let remaining: Map<String, Value> = params
      .iter()
      .filter(|(name, _)| !used.contains(*name))
      .map(|(name, value)| (name.clone(), value.clone()))
      .collect();
    let query = canonical_query(&remaining);

    if query.is_empty() {
      Ok(path)
    } else {
      let separator = if path.contains('?') { '&' } else { '?' };
      Ok(format!("{}{}{}", path, separator, query))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn map(value: Value) -> Map<String, Value> {
    match value {
      Value::Object(map) => map,
      _ => Map::new(),
    }
  }

  #[test]
  fn test_optional_id_template() {
    let formatter = UrlFormatter::new("/api/users/:id?").unwrap();
    let empty = Map::new();

    assert_eq!(
      formatter.format(ApiAction::Index, &empty, None).unwrap(),
      "/api/users"
    );
    assert_eq!(
      formatter
        .format(ApiAction::Show, &map(json!({"id": 3})), None)
        .unwrap(),
      "/api/users/3"
    );
    assert_eq!(
      formatter
        .format(ApiAction::Store, &empty, Some(&map(json!({"name": "kevin"}))))
        .unwrap(),
      "/api/users"
    );
  }

  #[test]
  fn test_payload_fills_path_but_not_query() {
    let formatter = UrlFormatter::new("/api/users/:id?").unwrap();
    let payload = map(json!({"id": 1, "name": "kevin hamer"}));
    assert_eq!(
      formatter
        .format(ApiAction::Update, &Map::new(), Some(&payload))
        .unwrap(),
      "/api/users/1"
    );
  }

  #[test]
  fn test_optional_group_with_suffix() {
    let formatter = UrlFormatter::new("/api/users/{:id.json}?").unwrap();
    assert_eq!(
      formatter
        .format(ApiAction::Show, &map(json!({"id": 3})), None)
        .unwrap(),
      "/api/users/3.json"
    );
    assert_eq!(
      formatter
        .format(ApiAction::Index, &Map::new(), None)
        .unwrap(),
      "/api/users"
    );
  }

  #[test]
  fn test_plain_base_url_appends_id() {
    let formatter = UrlFormatter::new("https://example.com:8080/api/users").unwrap();
    assert!(!formatter.template(ApiAction::Show).has_params());
    assert_eq!(
      formatter
        .format(ApiAction::Destroy, &map(json!({"id": "a b"})), None)
        .unwrap(),
      "https://example.com:8080/api/users/a%20b"
    );
    assert_eq!(
      formatter
        .format(
          ApiAction::Index,
          &map(json!({"sort": "name", "page": 2, "q": null})),
          None
        )
        .unwrap(),
      "https://example.com:8080/api/users?page=2&sort=name"
    );
  }

  #[test]
  fn test_missing_required_param() {
    let formatter = UrlFormatter::new("/api/teams/:team/users").unwrap();
    let err = formatter
      .format(ApiAction::Index, &Map::new(), None)
      .unwrap_err();
    assert_eq!(
      err.downcast_ref::<StoreError>(),
      Some(&StoreError::MissingUrlParam {
        template: "/api/teams/:team/users".into(),
        param: "team".into()
      })
    );
  }

  #[test]
  fn test_used_params_leave_query_string() {
    let formatter = UrlFormatter::new("/api/teams/:team/users").unwrap();
    let url = formatter
      .format(ApiAction::Index, &map(json!({"team": 7, "page": 1})), None)
      .unwrap();
    assert_eq!(url, "/api/teams/7/users?page=1");
  }

  #[test]
  fn test_singleton_ignores_id_and_action() {
    let formatter = UrlFormatter::singleton("/api/me").unwrap();
    assert_eq!(formatter.intent(), UrlIntent::Singleton);
    assert_eq!(
      formatter
        .format(ApiAction::Show, &Map::new(), None)
        .unwrap(),
      "/api/me"
    );
    assert_eq!(
      formatter
        .format(ApiAction::Update, &map(json!({"expand": "teams"})), None)
        .unwrap(),
      "/api/me?expand=teams"
    );
  }

  #[test]
  fn test_action_specific_template() {
    let formatter = UrlFormatter::new("/api/users/:id?")
      .unwrap()
      .with_template(ApiAction::Store, "/api/teams/:team/users")
      .unwrap();
    let url = formatter
      .format(
        ApiAction::Store,
        &Map::new(),
        Some(&map(json!({"team": 4, "name": "x"}))),
      )
      .unwrap();
    assert_eq!(url, "/api/teams/4/users");
  }

  #[test]
  fn test_invalid_templates() {
    assert!(UrlTemplate::parse("/api/{:id").is_err());
    assert!(UrlTemplate::parse("/api/}").is_err());
    assert_eq!(
      UrlTemplate::parse("/a/:b/{:c-:d}?").unwrap().param_names(),
      vec!["b", "c", "d"]
    );
  }
}
