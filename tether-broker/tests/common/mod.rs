//! Shared test infrastructure for end-to-end tests
//!
//! - `server`: spawns an isolated broker on a random port
//! - `client`: a thin HTTP client over the broker API
//! - `fixtures`: a stub identity provider with a signing JWKS
//! - `constants`: shared test configuration values

pub mod client;
pub mod constants;
pub mod fixtures;
pub mod server;

pub use client::TestClient;
pub use constants::*;
pub use fixtures::StubProvider;
pub use server::TestServer;
