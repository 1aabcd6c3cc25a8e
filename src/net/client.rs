//! Network seam between the router and the origin server.

use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use tracing::debug;

use super::types::{Headers, Request, Response};
use crate::error::ShellCacheError;

/// Anything that can perform a live fetch against the origin.
///
/// Transport errors are `NetworkFailure`; an HTTP error status is still a
/// response.
pub trait Network: Send + Sync {
  fn fetch<'a>(
    &'a self,
    request: &'a Request,
  ) -> BoxFuture<'a, Result<Response, ShellCacheError>>;
}

/// reqwest-backed network client
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Network for HttpNetwork {
  fn fetch<'a>(
    &'a self,
    request: &'a Request,
  ) -> BoxFuture<'a, Result<Response, ShellCacheError>> {
    async move {
      debug!(method = %request.method, url = %request.url, "network fetch");

      let resp = self
        .client
        .request(request.method.clone(), request.url.clone())
        .send()
        .await?;

      let status = resp.status().as_u16();
      let headers: Headers = resp
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
      let body = resp.bytes().await?.to_vec();

      Ok::<_, ShellCacheError>(Response::new(status, headers, body))
    }
    .boxed()
  }
}
