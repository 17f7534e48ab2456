mod models;
mod schema;
mod store;
mod trait_def;

pub use models::{
    AuthKind, Connection, ConnectionStatus, CredentialRecord, NewCredential, ProviderProfile,
};
pub use store::SqliteBrokerStore;
pub use trait_def::BrokerStore;
