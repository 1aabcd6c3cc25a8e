pub mod client;
#[cfg(test)]
pub mod stub;
pub mod types;

pub use client::{HttpNetwork, Network};
pub use types::{Headers, Request, Response};
