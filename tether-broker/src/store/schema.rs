//! SQLite schema definitions for the broker database.

use crate::sqlite_column;
use crate::sqlite_persistence::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema, DEFAULT_TIMESTAMP,
};

const CONNECTIONS_FK: ForeignKey = ForeignKey {
    foreign_table: "connections",
    foreign_column: "id",
    on_delete: ForeignKeyOnChange::Cascade,
};

const PROVIDERS_FK: ForeignKey = ForeignKey {
    foreign_table: "providers",
    foreign_column: "id",
    on_delete: ForeignKeyOnChange::Restrict,
};

/// Registered identity providers. Rows are soft-deleted so connection
/// history stays resolvable.
const PROVIDERS_TABLE: Table = Table {
    name: "providers",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("auth_kind", &SqlType::Text, non_null = true),
        sqlite_column!("client_id", &SqlType::Text),
        sqlite_column!("client_secret", &SqlType::Text),
        sqlite_column!("auth_url", &SqlType::Text),
        sqlite_column!("token_url", &SqlType::Text),
        sqlite_column!("issuer", &SqlType::Text),
        sqlite_column!(
            "enable_discovery",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("default_scopes", &SqlType::Text, non_null = true), // JSON array
        sqlite_column!("extra_params", &SqlType::Text), // JSON object
        sqlite_column!("credential_schema", &SqlType::Text), // JSON object
        sqlite_column!(
            "deleted",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
        sqlite_column!(
            "updated_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[("idx_providers_name", "name")],
    unique_constraints: &[],
};

/// Handshake contexts. The pending PKCE verifier lives here until the
/// connection reaches a terminal state.
const CONNECTIONS_TABLE: Table = Table {
    name: "connections",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("workspace_id", &SqlType::Text, non_null = true),
        sqlite_column!(
            "provider_id",
            &SqlType::Text,
            non_null = true,
            foreign_key = Some(&PROVIDERS_FK)
        ),
        sqlite_column!("scopes", &SqlType::Text, non_null = true), // JSON array
        sqlite_column!("return_url", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("failure_reason", &SqlType::Text),
        sqlite_column!("pkce_verifier", &SqlType::Text, non_null = true),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_connections_status", "status"),
        ("idx_connections_workspace", "workspace_id"),
    ],
    unique_constraints: &[],
};

/// Append-only sealed credential rows, one per successful exchange or
/// refresh. Never updated in place.
const CREDENTIALS_TABLE: Table = Table {
    name: "credentials",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "connection_id",
            &SqlType::Text,
            non_null = true,
            foreign_key = Some(&CONNECTIONS_FK)
        ),
        sqlite_column!("payload", &SqlType::Blob, non_null = true),
        sqlite_column!("has_access", &SqlType::Integer, non_null = true),
        sqlite_column!("has_refresh", &SqlType::Integer, non_null = true),
        sqlite_column!("expires_at", &SqlType::Integer),
        sqlite_column!("id_token", &SqlType::Blob),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_credentials_connection", "connection_id")],
    unique_constraints: &[],
};

pub const BROKER_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[PROVIDERS_TABLE, CONNECTIONS_TABLE, CREDENTIALS_TABLE],
    migration: None,
}];
