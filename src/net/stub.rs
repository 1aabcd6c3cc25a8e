//! Scripted network used by tests.

use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::{BoxFuture, FutureExt};

use super::client::Network;
use super::types::{Headers, Request, Response};
use crate::error::ShellCacheError;

/// Network that answers from a path -> response table.
///
/// Paths without a scripted reply fail like an unreachable origin.
#[derive(Default)]
pub struct StubNetwork {
  replies: Mutex<HashMap<String, Response>>,
  calls: Mutex<Vec<String>>,
}

impl StubNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  /// Script a 200 reply with the given body and optional Date header
  pub fn ok(self, path: &str, body: &str, date: Option<&str>) -> Self {
    let mut headers = Headers::new();
    headers.set("content-type", "application/octet-stream");
    if let Some(date) = date {
      headers.set("date", date);
    }
    self.reply(path, Response::new(200, headers, body.as_bytes().to_vec()))
  }

  pub fn reply(self, path: &str, response: Response) -> Self {
    self
      .replies
      .lock()
      .unwrap()
      .insert(path.to_string(), response);
    self
  }

  /// Drop the scripted reply so the path starts failing
  pub fn go_offline(&self, path: &str) {
    self.replies.lock().unwrap().remove(path);
  }

  pub fn go_offline_all(&self) {
    self.replies.lock().unwrap().clear();
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }
}

impl Network for StubNetwork {
  fn fetch<'a>(
    &'a self,
    request: &'a Request,
  ) -> BoxFuture<'a, Result<Response, ShellCacheError>> {
    let path = request.url.path().to_string();
    self.calls.lock().unwrap().push(path.clone());
    let reply = self.replies.lock().unwrap().get(&path).cloned();
    async move {
      reply.ok_or_else(|| ShellCacheError::NetworkFailure(format!("{} unreachable", path)))
    }
    .boxed()
  }
}
