//! Shared constants for end-to-end tests

/// API key accepted by every test server
pub const TEST_API_KEY: &str = "test-api-key";

/// HMAC key the test server signs state with; tests re-derive the codec
/// from this to inspect envelopes.
pub const TEST_STATE_KEY: [u8; 32] = [7u8; 32];

/// Client id registered for stub providers
pub const TEST_CLIENT_ID: &str = "client-1";

/// Request timeout for test HTTP calls
pub const REQUEST_TIMEOUT_SECS: u64 = 5;

/// How long to wait for a test server to become ready
pub const SERVER_READY_TIMEOUT_MS: u64 = 5_000;

/// Poll interval while waiting for readiness
pub const SERVER_READY_POLL_INTERVAL_MS: u64 = 20;
