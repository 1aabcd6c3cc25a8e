//! Request and response types that flow between the dashboard and the origin.

use chrono::{DateTime, FixedOffset};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

/// Header carrying the origin-supplied timestamp used for age checks
pub const DATE_HEADER: &str = "date";

/// An outgoing request issued by the dashboard
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self { method, url }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }
}

/// Ordered header set with case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
  pub fn new() -> Self {
    Self(Vec::new())
  }

  /// Get the first value for a header name
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .0
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Replace any existing values for `name` with `value`
  pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
    self.0.push((name, value.into()));
  }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
  fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
    Self(
      iter
        .into_iter()
        .map(|(n, v)| (n.into(), v.into()))
        .collect(),
    )
  }
}

/// A response snapshot: status, headers and full body bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, headers: Headers, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers,
      body: body.into(),
    }
  }

  pub fn is_ok(&self) -> bool {
    self.status == 200
  }

  /// Parse the origin `Date` header.
  ///
  /// Returns None when the header is missing or not a valid HTTP-date.
  pub fn timestamp(&self) -> Option<DateTime<FixedOffset>> {
    let raw = self.headers.get(DATE_HEADER)?;
    DateTime::parse_from_rfc2822(raw.trim()).ok()
  }
}
