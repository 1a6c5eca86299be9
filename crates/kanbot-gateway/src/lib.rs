//! Remote agent gateway: the HTTP client, its response envelope, and a
//! scripted stand-in for tests.

pub mod client;
pub mod envelope;
pub mod mock;

pub use client::HttpGateway;
pub use envelope::{InvokeBody, InvokeEnvelope};
pub use mock::{MockGateway, MockSpawn};
