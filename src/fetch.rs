//! The outgoing-request primitive the cache consumes.
//!
//! Everything the engine knows about the network goes through [`Fetcher`]. Production hosts
//! use [`HttpFetcher`]; tests script responses per url.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use url::Url;

use crate::error::CacheError;
use crate::timing::Timing;

/// An outgoing request: method, absolute url, headers and an optional form body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
  method: Method,
  url: Url,
  headers: Vec<(String, String)>,
  form: Option<Vec<(String, String)>>,
}

impl FetchRequest {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      form: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A `POST` with an urlencoded form body.
  pub fn post_form<K, V>(url: Url, form: impl IntoIterator<Item = (K, V)>) -> Self
  where
    K: Into<String>,
    V: Into<String>,
  {
    let mut request = Self::new(Method::POST, url);
    request.form = Some(
      form
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect(),
    );
    request
  }

  /// Parse `url`, resolving it against `base` when it is relative.
  pub fn parse(method: Method, url: &str, base: Option<&Url>) -> Result<Self, CacheError> {
    let parsed = match base {
      Some(base) => base.join(url),
      None => Url::parse(url),
    }
    .map_err(|e| CacheError::InvalidRequest(format!("bad url {}: {}", url, e)))?;
    Ok(Self::new(method, parsed))
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn method(&self) -> &Method {
    &self.method
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  pub fn path(&self) -> &str {
    self.url.path()
  }

  pub fn headers(&self) -> &[(String, String)] {
    &self.headers
  }

  pub fn form(&self) -> Option<&[(String, String)]> {
    self.form.as_deref()
  }

  /// Header lookup, case-insensitive on the name.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn has_header(&self, name: &str) -> bool {
    self.header(name).is_some()
  }

  /// A request parameter: the form body wins over the query string.
  pub fn param(&self, name: &str) -> Option<String> {
    if let Some(form) = &self.form {
      if let Some((_, v)) = form.iter().find(|(k, _)| k == name) {
        return Some(v.clone());
      }
    }
    self
      .url
      .query_pairs()
      .find(|(k, _)| k == name)
      .map(|(_, v)| v.into_owned())
  }

  /// Query string and form body parameters, in that order.
  pub fn params(&self) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = self
      .url
      .query_pairs()
      .map(|(k, v)| (k.into_owned(), v.into_owned()))
      .collect();
    if let Some(form) = &self.form {
      params.extend(form.iter().cloned());
    }
    params
  }

  /// Name of the result channel this request publishes to. See [`canonical_url`].
  pub fn channel_name(&self) -> String {
    canonical_url(&self.method, &self.url, self.form().unwrap_or_default())
  }
}

/// Canonical form of a request: origin, path and every parameter (query string plus form
/// body) sorted by key, prefixed with the method when it is not `GET`.
///
/// Two requests asking for the same thing produce the same name regardless of the order
/// their parameters were written in.
pub fn canonical_url(method: &Method, url: &Url, form: &[(String, String)]) -> String {
  let mut params: Vec<(String, String)> = url
    .query_pairs()
    .map(|(k, v)| (k.into_owned(), v.into_owned()))
    .chain(form.iter().cloned())
    .collect();
  params.sort();

  let mut canonical = url.clone();
  canonical.set_fragment(None);
  canonical.set_query(None);
  if !params.is_empty() {
    canonical.query_pairs_mut().extend_pairs(params);
  }

  if *method == Method::GET {
    canonical.to_string()
  } else {
    format!("{} {}", method, canonical)
  }
}

/// Status plus raw body of a network response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
  pub status: u16,
  pub body: Vec<u8>,
}

impl FetchResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      body: body.into(),
    }
  }

  /// A 200 response carrying `value` as JSON.
  pub fn ok_json(value: &Value) -> Self {
    Self::new(200, value.to_string())
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Decode the body as JSON. `url` only labels the error.
  pub fn json(&self, url: &str) -> Result<Value, CacheError> {
    serde_json::from_slice(&self.body).map_err(|e| CacheError::payload(url, e.to_string()))
  }
}

/// The network side of the race.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, CacheError>;
}

/// Fetch `request` and decode a successful response as JSON.
pub async fn fetch_json(
  fetcher: &dyn Fetcher,
  request: &FetchRequest,
  category: &'static str,
) -> Result<Value, CacheError> {
  let url = request.url().to_string();
  tracing::debug!(%url, method = %request.method(), "network fetch");

  let timing = Timing::start(category, "Network", url.clone());
  let response = fetcher.fetch(request).await?;
  timing.end();

  if !response.is_success() {
    return Err(CacheError::Status {
      url,
      status: response.status,
    });
  }

  let timing = Timing::start(category, "Parse JSON", url.clone());
  let json = response.json(&url)?;
  timing.end();
  Ok(json)
}

/// [`Fetcher`] backed by a reqwest client.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> color_eyre::Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("rangecache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| color_eyre::eyre::eyre!("Failed to create HTTP client: {}", e))?;
    Ok(Self { client })
  }

  pub fn with_client(client: reqwest::Client) -> Self {
    Self { client }
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, CacheError> {
    let url = request.url().to_string();
    let mut builder = self
      .client
      .request(request.method().clone(), request.url().clone());
    for (name, value) in request.headers() {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(form) = request.form() {
      builder = builder.form(form);
    }

    let response = builder.send().await.map_err(|e| CacheError::Network {
      url: url.clone(),
      message: e.to_string(),
    })?;
    let status = response.status().as_u16();
    let body = response
      .bytes()
      .await
      .map_err(|e| CacheError::Network {
        url,
        message: e.to_string(),
      })?;
    Ok(FetchResponse::new(status, body.to_vec()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn channel_name_sorts_parameters() {
    let a = FetchRequest::get(url("https://perf.example.com/api/x?b=2&a=1#frag"));
    let b = FetchRequest::get(url("https://perf.example.com/api/x?a=1&b=2"));
    assert_eq!(a.channel_name(), b.channel_name());
    assert_eq!(a.channel_name(), "https://perf.example.com/api/x?a=1&b=2");
  }

  #[test]
  fn channel_name_includes_form_and_method() {
    let request = FetchRequest::post_form(
      url("https://perf.example.com/api/timeseries2"),
      [("columns", "revision,avg"), ("bot", "linux")],
    );
    assert_eq!(
      request.channel_name(),
      "POST https://perf.example.com/api/timeseries2?bot=linux&columns=revision%2Cavg"
    );
  }

  #[test]
  fn form_parameters_shadow_query() {
    let request = FetchRequest::post_form(url("https://h/p?bot=query&x=1"), [("bot", "form")]);
    assert_eq!(request.param("bot").as_deref(), Some("form"));
    assert_eq!(request.param("x").as_deref(), Some("1"));
    assert_eq!(request.param("missing"), None);
  }

  #[test]
  fn headers_are_case_insensitive() {
    let request = FetchRequest::get(url("https://h/p")).with_header("Authorization", "Bearer t");
    assert!(request.has_header("authorization"));
    assert!(!request.has_header("cookie"));
  }

  #[test]
  fn relative_urls_need_a_base() {
    let base = url("https://perf.example.com/");
    let request = FetchRequest::parse(Method::GET, "/api/describe", Some(&base)).unwrap();
    assert_eq!(request.url().as_str(), "https://perf.example.com/api/describe");
    assert!(matches!(
      FetchRequest::parse(Method::GET, "/api/describe", None),
      Err(CacheError::InvalidRequest(_))
    ));
  }

  #[test]
  fn responses_decode_json() {
    let response = FetchResponse::ok_json(&serde_json::json!({"sid": "abc"}));
    assert!(response.is_success());
    assert_eq!(response.json("u").unwrap()["sid"], "abc");
    assert!(matches!(
      FetchResponse::new(200, "not json").json("u"),
      Err(CacheError::Payload { .. })
    ));
  }
}
