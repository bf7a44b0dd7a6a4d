//! Network side of the controller: request/response snapshots and the
//! `Fetch` seam used to reach the origin.

mod client;
#[cfg(test)]
pub mod testing;
mod types;

pub use client::{Fetch, HttpClient};
pub use types::{Request, RequestMode, Response};
