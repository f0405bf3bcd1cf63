use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Client, Method};
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use super::{ApiAction, CustomAction, HttpQueue, ResourceApi, UrlFormatter, UrlIntent, UrlTemplate};
use crate::params::canonical_query;

/// Header carrying the anti-forgery token on every request.
pub const XSRF_HEADER: &str = "X-XSRF-TOKEN";

/// [`ResourceApi`] over a JSON REST endpoint.
///
/// | action  | method | URL                 | body    |
/// |---------|--------|---------------------|---------|
/// | index   | GET    | base + query string | -       |
/// | show    | GET    | element URL         | -       |
/// | store   | POST   | base                | element |
/// | update  | PUT    | element URL         | element |
/// | destroy | DELETE | element URL         | -       |
///
/// Index responses are returned whole. Every other response is unwrapped
/// from its `data` member when it has one.
#[derive(Debug, Clone)]
pub struct JsonApi {
  client: Client,
  formatter: UrlFormatter,
  queue: HttpQueue,
  headers: HeaderMap,
  element_field: Option<String>,
  origin: Option<Url>,
}

impl JsonApi {
  /// Collection endpoint at `base_url`, which may be a URL template.
  pub fn new(base_url: &str) -> Result<Self> {
    Self::from_formatter(UrlFormatter::new(base_url)?)
  }

  /// Singleton endpoint: every action hits `url`.
  pub fn singleton(url: &str) -> Result<Self> {
    Self::from_formatter(UrlFormatter::singleton(url)?)
  }

  pub fn from_formatter(formatter: UrlFormatter) -> Result<Self> {
    let client = Client::builder()
      .user_agent(concat!("clockvine/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      formatter,
      queue: HttpQueue::default(),
      headers: HeaderMap::new(),
      element_field: Some("data".to_string()),
      origin: None,
    })
  }

  pub fn with_id_field(mut self, id_field: impl Into<String>) -> Self {
    self.formatter = self.formatter.with_id_field(id_field);
    self
  }

  /// Resolve relative URLs against `origin`.
  pub fn with_origin(mut self, origin: &str) -> Result<Self> {
    let origin = Url::parse(origin).map_err(|e| eyre!("Invalid origin {}: {}", origin, e))?;
    self.origin = Some(origin);
    Ok(self)
  }

  /// Share a request queue, and with it a concurrency limit.
  pub fn with_queue(mut self, queue: HttpQueue) -> Self {
    self.queue = queue;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
    let name = HeaderName::from_bytes(name.as_bytes())
      .map_err(|e| eyre!("Invalid header name {}: {}", name, e))?;
    let value =
      HeaderValue::from_str(value).map_err(|e| eyre!("Invalid value for header {}: {}", name, e))?;
    self.headers.insert(name, value);
    Ok(self)
  }

  pub fn with_xsrf_token(self, token: &str) -> Result<Self> {
    self.with_header(XSRF_HEADER, token)
  }

  pub fn with_bearer_token(self, token: &str) -> Result<Self> {
    self.with_header(AUTHORIZATION.as_str(), &format!("Bearer {}", token))
  }

  /// Member unwrapped from element responses; `None` keeps responses whole.
  pub fn with_element_field(mut self, field: Option<String>) -> Self {
    self.element_field = field;
    self
  }

  pub fn formatter(&self) -> &UrlFormatter {
    &self.formatter
  }

  /// Absolute URL for an action.
  pub fn url_for(
    &self,
    action: ApiAction,
    params: &Map<String, Value>,
    payload: Option<&Map<String, Value>>,
  ) -> Result<String> {
    let path = self.formatter.format(action, params, payload)?;
    self.resolve(path)
  }

  fn resolve(&self, path: String) -> Result<String> {
    match &self.origin {
      Some(origin) => origin
        .join(&path)
        .map(String::from)
        .map_err(|e| eyre!("Failed to resolve {} against {}: {}", path, origin, e)),
      None => Ok(path),
    }
  }

  fn unwrap_element(&self, response: Value) -> Value {
    let Some(field) = &self.element_field else {
      return response;
    };
    match response {
      Value::Object(mut envelope) if envelope.contains_key(field) => {
        envelope.remove(field).unwrap_or_default()
      }
      other => other,
    }
  }

  async fn call(
    &self,
    action: ApiAction,
    template: Option<UrlTemplate>,
    element: Value,
    params: Map<String, Value>,
  ) -> Result<Value> {
    let payload = element.as_object();
    let path = match &template {
      Some(template) => self.formatter.format_with(template, action, &params, payload)?,
      None => self.formatter.format(action, &params, payload)?,
    };
    let url = self.resolve(path)?;

    let (method, body) = match action {
      ApiAction::Index | ApiAction::Show => (Method::GET, None),
      ApiAction::Store => (Method::POST, Some(element)),
      ApiAction::Update => (Method::PUT, Some(element)),
      ApiAction::Destroy => (Method::DELETE, None),
    };

    let response = self.request(method, url, body).await?;
    if action == ApiAction::Index {
      Ok(response)
    } else {
      Ok(self.unwrap_element(response))
    }
  }

  async fn request(&self, method: Method, url: String, body: Option<Value>) -> Result<Value> {
    self
      .queue
      .enqueue(async {
        debug!(%method, %url, "Sending request");

        let mut request = self
          .client
          .request(method.clone(), &url)
          .headers(self.headers.clone())
          .header(ACCEPT, "application/json");
        if let Some(body) = &body {
          request = request.json(body);
        }

        let response = request
          .send()
          .await
          .map_err(|e| eyre!("Failed to send {} {}: {}", method, url, e))?;
        let status = response.status();
        let bytes = response
          .bytes()
          .await
          .map_err(|e| eyre!("Failed to read response from {}: {}", url, e))?;

        if !status.is_success() {
          return Err(eyre!(
            "{} {} returned {}: {}",
            method,
            url,
            status,
            String::from_utf8_lossy(&bytes)
          ));
        }
        if bytes.iter().all(u8::is_ascii_whitespace) {
          return Ok(Value::Null);
        }

        serde_json::from_slice(&bytes)
          .map_err(|e| eyre!("Failed to parse response from {}: {}", url, e))
      })
      .await
  }
}

impl ResourceApi for JsonApi {
  /// The index URL without origin, so two parameter sets share a cache entry
  /// exactly when they would hit the same URL.
  fn key(&self, params: &Map<String, Value>) -> String {
    self
      .formatter
      .format(ApiAction::Index, params, None)
      .unwrap_or_else(|_| canonical_query(params))
  }

  fn index(&self, params: Map<String, Value>) -> BoxFuture<'_, Result<Value>> {
    self
      .call(ApiAction::Index, None, Value::Null, params)
      .boxed()
  }

  fn show(&self, id: Value) -> BoxFuture<'_, Result<Value>> {
    let mut params = Map::new();
    if self.formatter.intent() == UrlIntent::Collection && !id.is_null() {
      params.insert(self.formatter.id_field().to_string(), id);
    }
    self.call(ApiAction::Show, None, Value::Null, params).boxed()
  }

  fn store(&self, element: Value, params: Map<String, Value>) -> BoxFuture<'_, Result<Value>> {
    self.call(ApiAction::Store, None, element, params).boxed()
  }

  fn update(&self, element: Value, params: Map<String, Value>) -> BoxFuture<'_, Result<Value>> {
    self.call(ApiAction::Update, None, element, params).boxed()
  }

  fn destroy(&self, element: Value, params: Map<String, Value>) -> BoxFuture<'_, Result<Value>> {
    self.call(ApiAction::Destroy, None, element, params).boxed()
  }

  fn perform<'a>(
    &'a self,
    _name: &'a str,
    action: &'a CustomAction,
    element: Value,
    params: Map<String, Value>,
  ) -> BoxFuture<'a, Result<Value>> {
    async move {
      let template = action.url.as_deref().map(UrlTemplate::parse).transpose()?;
      self.call(action.api_action, template, element, params).await
    }
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  fn map(value: Value) -> Map<String, Value> {
    match value {
      Value::Object(map) => map,
      _ => Map::new(),
    }
  }

  /// Serve one canned response and hand back the raw request head.
  async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = format!("http://{}", listener.local_addr().unwrap());
    let handle = tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut head = Vec::new();
      let mut buf = [0u8; 1024];
      while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
          break;
        }
        head.extend_from_slice(&buf[..n]);
      }
      let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
      );
      socket.write_all(response.as_bytes()).await.unwrap();
      socket.shutdown().await.ok();
      String::from_utf8_lossy(&head).into_owned()
    });
    (origin, handle)
  }

  #[test]
  fn test_key_is_index_url() {
    let api = JsonApi::new("/api/users").unwrap();
    let a = map(json!({"sort": "name", "page": 2}));
    let b = map(json!({"page": 2, "sort": "name"}));
    assert_eq!(api.key(&a), "/api/users?page=2&sort=name");
    assert_eq!(api.key(&a), api.key(&b));
  }

  #[test]
  fn test_url_for_with_origin() {
    let api = JsonApi::new("/api/users/:id?")
      .unwrap()
      .with_origin("https://example.com")
      .unwrap();
    assert_eq!(
      api
        .url_for(ApiAction::Show, &map(json!({"id": 3})), None)
        .unwrap(),
      "https://example.com/api/users/3"
    );
    assert_eq!(
      api
        .url_for(ApiAction::Index, &map(json!({"page": 1})), None)
        .unwrap(),
      "https://example.com/api/users?page=1"
    );
  }

  #[test]
  fn test_unwrap_element() {
    let api = JsonApi::new("/api/users").unwrap();
    assert_eq!(
      api.unwrap_element(json!({"data": {"id": 1}})),
      json!({"id": 1})
    );
    assert_eq!(api.unwrap_element(json!({"id": 1})), json!({"id": 1}));

    let raw = api.with_element_field(None);
    assert_eq!(
      raw.unwrap_element(json!({"data": {"id": 1}})),
      json!({"data": {"id": 1}})
    );
  }

  #[test]
  fn test_rejects_bad_headers() {
    let api = JsonApi::new("/api/users").unwrap();
    assert!(api.clone().with_header("bad header", "x").is_err());
    assert!(api.with_xsrf_token("token-123").is_ok());
  }

  #[tokio::test]
  async fn test_show_unwraps_data_and_sends_headers() {
    let (origin, server) = serve_once("200 OK", r#"{"data":{"id":3,"name":"Kevin"}}"#).await;
    let api = JsonApi::new("/api/users/:id?")
      .unwrap()
      .with_origin(&origin)
      .unwrap()
      .with_xsrf_token("abc")
      .unwrap();

    let element = api.show(json!(3)).await.unwrap();
    assert_eq!(element, json!({"id": 3, "name": "Kevin"}));

    let head = server.await.unwrap().to_lowercase();
    assert!(head.starts_with("get /api/users/3 "));
    assert!(head.contains("x-xsrf-token: abc"));
    assert!(head.contains("accept: application/json"));
  }

  #[tokio::test]
  async fn test_index_returns_whole_envelope() {
    let (origin, server) = serve_once("200 OK", r#"{"data":[{"id":1}],"meta":{"total":1}}"#).await;
    let api = JsonApi::new("/api/users").unwrap().with_origin(&origin).unwrap();

    let response = api.index(map(json!({"page": 1}))).await.unwrap();
    assert_eq!(response["meta"]["total"], json!(1));
    assert!(server.await.unwrap().starts_with("GET /api/users?page=1 "));
  }

  #[tokio::test]
  async fn test_error_status_is_an_error() {
    let (origin, server) = serve_once("404 Not Found", r#"{"message":"nope"}"#).await;
    let api = JsonApi::new("/api/users").unwrap().with_origin(&origin).unwrap();

    let err = api.show(json!(9)).await.unwrap_err();
    assert!(err.to_string().contains("404"));
    server.await.unwrap();
  }

  #[tokio::test]
  async fn test_empty_body_is_null() {
    let (origin, server) = serve_once("200 OK", "").await;
    let api = JsonApi::new("/api/users").unwrap().with_origin(&origin).unwrap();

    let response = api
      .destroy(json!({"id": 4}), Map::new())
      .await
      .unwrap();
    assert_eq!(response, Value::Null);
    assert!(server.await.unwrap().starts_with("DELETE /api/users/4 "));
  }
}
