//! BrokerStore trait definition.

use super::models::{Connection, CredentialRecord, NewCredential, ProviderProfile};
use anyhow::Result;

/// Trait for broker storage backends.
pub trait BrokerStore: Send + Sync {
    // =========================================================================
    // Providers
    // =========================================================================

    /// Insert a provider profile. Fails when a live (non-deleted) provider
    /// already holds the name; a soft-deleted row does not block reuse.
    fn create_provider(&self, profile: &ProviderProfile) -> Result<()>;

    /// Get a provider by id, including soft-deleted rows.
    fn get_provider(&self, id: &str) -> Result<Option<ProviderProfile>>;

    /// Get a live provider by its short name.
    fn get_provider_by_name(&self, name: &str) -> Result<Option<ProviderProfile>>;

    /// List all live providers.
    fn list_providers(&self) -> Result<Vec<ProviderProfile>>;

    /// Replace a provider's mutable fields. Returns false when the id is
    /// unknown or the row is soft-deleted.
    fn update_provider(&self, profile: &ProviderProfile) -> Result<bool>;

    /// Soft-delete a provider. Returns false when already gone.
    fn soft_delete_provider(&self, id: &str) -> Result<bool>;

    // =========================================================================
    // Connections
    // =========================================================================

    /// Persist a freshly issued pending connection.
    fn insert_connection(&self, connection: &Connection) -> Result<()>;

    fn get_connection(&self, id: &str) -> Result<Option<Connection>>;

    /// Transition pending -> active. Returns false when the connection is
    /// missing or already terminal; a connection takes exactly one
    /// terminal transition.
    fn activate_connection(&self, id: &str) -> Result<bool>;

    /// Transition pending -> failed with a recorded reason. Returns false
    /// when the connection is missing or already terminal.
    fn fail_connection(&self, id: &str, reason: &str) -> Result<bool>;

    /// Mark every pending connection created before `cutoff` as failed
    /// with reason "expired". Returns the number of rows swept.
    fn expire_pending_before(&self, cutoff: i64) -> Result<usize>;

    // =========================================================================
    // Credentials
    // =========================================================================

    /// Append a sealed credential row with `created_at = now`.
    fn insert_credential(&self, credential: &NewCredential) -> Result<i64>;

    /// The credential row with the greatest `created_at` (ties broken by
    /// highest id). This ordering is what makes refresh-then-read safe.
    fn latest_credential(&self, connection_id: &str) -> Result<Option<CredentialRecord>>;

    /// Number of credential rows for a connection.
    fn count_credentials(&self, connection_id: &str) -> Result<usize>;
}
