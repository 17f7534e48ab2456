//! The consent/callback handshake pipeline.

mod callback;
mod consent;

pub use callback::{CallbackDisposition, CallbackExecutor};
pub use consent::{pkce_challenge, ConsentBuilder, ConsentError, ConsentSettings, ConsentSpec};
