//! Offline page served when neither the network nor the cache can answer.

use crate::net::{Headers, Response};

pub const OFFLINE_STATUS: u16 = 503;
pub const OFFLINE_CONTENT_TYPE: &str = "text/html; charset=utf-8";

const OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Offline</title>
</head>
<body>
  <main>
    <h1>You are offline</h1>
    <p>This page is not available without a network connection. Reconnect and try again.</p>
  </main>
</body>
</html>
"#;

/// Build the synthesized offline response. Never written to the cache.
pub fn offline_response() -> Response {
  let mut headers = Headers::new();
  headers.set("content-type", OFFLINE_CONTENT_TYPE);
  headers.set("cache-control", "no-store");
  Response::new(OFFLINE_STATUS, headers, OFFLINE_PAGE.as_bytes().to_vec())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_offline_response_shape() {
    let response = offline_response();
    assert_eq!(response.status, 503);
    assert_eq!(
      response.headers.get("Content-Type"),
      Some("text/html; charset=utf-8")
    );
    assert!(String::from_utf8_lossy(&response.body).contains("<html"));
    assert!(response.timestamp().is_none());
  }
}
