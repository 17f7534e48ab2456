//! SQLite-backed broker store implementation.

use super::models::{
    Connection as BrokerConnection, ConnectionStatus, CredentialRecord, NewCredential,
    ProviderProfile,
};
use super::schema::BROKER_VERSIONED_SCHEMAS;
use super::trait_def::BrokerStore;
use crate::sqlite_persistence::migrate_if_needed;
use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// SQLite-backed broker store.
///
/// One write connection and one read connection, each behind its own
/// mutex, both in WAL mode. Credential rows are append-only; read paths
/// always pick the newest row.
#[derive(Clone)]
pub struct SqliteBrokerStore {
    read_conn: Arc<Mutex<Connection>>,
    write_conn: Arc<Mutex<Connection>>,
}

impl SqliteBrokerStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path_ref = db_path.as_ref();

        let mut write_conn = Connection::open_with_flags(
            db_path_ref,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI
                | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open broker database")?;

        migrate_if_needed(&mut write_conn, BROKER_VERSIONED_SCHEMAS, "broker")?;

        write_conn
            .pragma_update(None, "journal_mode", "WAL")
            .context("Failed to set WAL mode on broker write connection")?;

        let read_conn = Connection::open_with_flags(
            db_path_ref,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY
                | rusqlite::OpenFlags::SQLITE_OPEN_URI
                | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open broker database for reading")?;

        read_conn
            .pragma_update(None, "journal_mode", "WAL")
            .context("Failed to set WAL mode on broker read connection")?;

        let providers: usize =
            read_conn.query_row("SELECT COUNT(*) FROM providers WHERE deleted = 0", [], |r| {
                r.get(0)
            })?;
        let connections: usize =
            read_conn.query_row("SELECT COUNT(*) FROM connections", [], |r| r.get(0))?;
        info!(
            "Broker store ready: {} providers, {} connections",
            providers, connections
        );

        Ok(Self {
            read_conn: Arc::new(Mutex::new(read_conn)),
            write_conn: Arc::new(Mutex::new(write_conn)),
        })
    }
}

// Helper: serialize a string list to its JSON column form
fn json_list(list: &[String]) -> String {
    serde_json::to_string(list).unwrap()
}

// Helper: deserialize a JSON array column, tolerating malformed rows
fn parse_json_list(s: String) -> Vec<String> {
    serde_json::from_str(&s).unwrap_or_else(|e| {
        warn!("Malformed JSON array in broker db: {}: {}", s, e);
        Vec::new()
    })
}

fn json_map_or_null(map: &BTreeMap<String, String>) -> Option<String> {
    if map.is_empty() {
        None
    } else {
        Some(serde_json::to_string(map).unwrap())
    }
}

fn parse_json_map(s: Option<String>) -> BTreeMap<String, String> {
    s.and_then(|json| serde_json::from_str(&json).ok())
        .unwrap_or_default()
}

fn provider_from_row(row: &Row<'_>) -> rusqlite::Result<ProviderProfile> {
    let auth_kind: String = row.get(2)?;
    let default_scopes: String = row.get(9)?;
    let extra_params: Option<String> = row.get(10)?;
    let credential_schema: Option<String> = row.get(11)?;
    Ok(ProviderProfile {
        id: row.get(0)?,
        name: row.get(1)?,
        auth_kind: FromStr::from_str(&auth_kind).unwrap_or(super::models::AuthKind::Oauth2),
        client_id: row.get(3)?,
        client_secret: row.get(4)?,
        auth_url: row.get(5)?,
        token_url: row.get(6)?,
        issuer: row.get(7)?,
        enable_discovery: row.get::<_, i64>(8)? != 0,
        default_scopes: parse_json_list(default_scopes),
        extra_params: parse_json_map(extra_params),
        credential_schema: credential_schema.and_then(|s| serde_json::from_str(&s).ok()),
        deleted: row.get::<_, i64>(12)? != 0,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

const PROVIDER_COLUMNS: &str = "id, name, auth_kind, client_id, client_secret, auth_url, \
     token_url, issuer, enable_discovery, default_scopes, extra_params, credential_schema, \
     deleted, created_at, updated_at";

fn connection_from_row(row: &Row<'_>) -> rusqlite::Result<BrokerConnection> {
    let scopes: String = row.get(3)?;
    let status: String = row.get(5)?;
    Ok(BrokerConnection {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        provider_id: row.get(2)?,
        scopes: parse_json_list(scopes),
        return_url: row.get(4)?,
        status: FromStr::from_str(&status).unwrap_or(ConnectionStatus::Failed),
        failure_reason: row.get(6)?,
        pkce_verifier: row.get(7)?,
        created_at: row.get(8)?,
    })
}

impl BrokerStore for SqliteBrokerStore {
    fn create_provider(&self, profile: &ProviderProfile) -> Result<()> {
        let conn = self.write_conn.lock().unwrap();
        let taken: i64 = conn.query_row(
            "SELECT COUNT(*) FROM providers WHERE name = ?1 AND deleted = 0",
            params![profile.name],
            |r| r.get(0),
        )?;
        if taken > 0 {
            bail!("provider name {} already registered", profile.name);
        }
        conn.execute(
            "INSERT INTO providers
             (id, name, auth_kind, client_id, client_secret, auth_url, token_url, issuer,
              enable_discovery, default_scopes, extra_params, credential_schema, deleted,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, ?13, ?13)",
            params![
                profile.id,
                profile.name,
                profile.auth_kind.as_str(),
                profile.client_id,
                profile.client_secret,
                profile.auth_url,
                profile.token_url,
                profile.issuer,
                profile.enable_discovery as i64,
                json_list(&profile.default_scopes),
                json_map_or_null(&profile.extra_params),
                profile
                    .credential_schema
                    .as_ref()
                    .map(|v| serde_json::to_string(v).unwrap()),
                profile.created_at,
            ],
        )?;
        Ok(())
    }

    fn get_provider(&self, id: &str) -> Result<Option<ProviderProfile>> {
        let conn = self.read_conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM providers WHERE id = ?1",
            PROVIDER_COLUMNS
        ))?;
        Ok(stmt.query_row(params![id], provider_from_row).optional()?)
    }

    fn get_provider_by_name(&self, name: &str) -> Result<Option<ProviderProfile>> {
        let conn = self.read_conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM providers WHERE name = ?1 AND deleted = 0",
            PROVIDER_COLUMNS
        ))?;
        Ok(stmt.query_row(params![name], provider_from_row).optional()?)
    }

    fn list_providers(&self) -> Result<Vec<ProviderProfile>> {
        let conn = self.read_conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM providers WHERE deleted = 0 ORDER BY name",
            PROVIDER_COLUMNS
        ))?;
        let rows = stmt.query_map([], provider_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn update_provider(&self, profile: &ProviderProfile) -> Result<bool> {
        let conn = self.write_conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE providers SET
               name = ?2, auth_kind = ?3, client_id = ?4, client_secret = ?5, auth_url = ?6,
               token_url = ?7, issuer = ?8, enable_discovery = ?9, default_scopes = ?10,
               extra_params = ?11, credential_schema = ?12, updated_at = ?13
             WHERE id = ?1 AND deleted = 0",
            params![
                profile.id,
                profile.name,
                profile.auth_kind.as_str(),
                profile.client_id,
                profile.client_secret,
                profile.auth_url,
                profile.token_url,
                profile.issuer,
                profile.enable_discovery as i64,
                json_list(&profile.default_scopes),
                json_map_or_null(&profile.extra_params),
                profile
                    .credential_schema
                    .as_ref()
                    .map(|v| serde_json::to_string(v).unwrap()),
                profile.updated_at,
            ],
        )?;
        Ok(changed > 0)
    }

    fn soft_delete_provider(&self, id: &str) -> Result<bool> {
        let conn = self.write_conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE providers SET deleted = 1 WHERE id = ?1 AND deleted = 0",
            params![id],
        )?;
        Ok(changed > 0)
    }

    fn insert_connection(&self, connection: &BrokerConnection) -> Result<()> {
        let conn = self.write_conn.lock().unwrap();
        conn.execute(
            "INSERT INTO connections
             (id, workspace_id, provider_id, scopes, return_url, status, failure_reason,
              pkce_verifier, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                connection.id,
                connection.workspace_id,
                connection.provider_id,
                json_list(&connection.scopes),
                connection.return_url,
                connection.status.as_str(),
                connection.failure_reason,
                connection.pkce_verifier,
                connection.created_at,
            ],
        )?;
        Ok(())
    }

    fn get_connection(&self, id: &str) -> Result<Option<BrokerConnection>> {
        let conn = self.read_conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT id, workspace_id, provider_id, scopes, return_url, status, failure_reason,
                    pkce_verifier, created_at
             FROM connections WHERE id = ?1",
        )?;
        Ok(stmt.query_row(params![id], connection_from_row).optional()?)
    }

    fn activate_connection(&self, id: &str) -> Result<bool> {
        let conn = self.write_conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE connections SET status = 'active' WHERE id = ?1 AND status = 'pending'",
            params![id],
        )?;
        Ok(changed > 0)
    }

    fn fail_connection(&self, id: &str, reason: &str) -> Result<bool> {
        let conn = self.write_conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE connections SET status = 'failed', failure_reason = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, reason],
        )?;
        Ok(changed > 0)
    }

    fn expire_pending_before(&self, cutoff: i64) -> Result<usize> {
        let conn = self.write_conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE connections SET status = 'failed', failure_reason = 'expired'
             WHERE status = 'pending' AND created_at < ?1",
            params![cutoff],
        )?;
        Ok(changed)
    }

    fn insert_credential(&self, credential: &NewCredential) -> Result<i64> {
        let conn = self.write_conn.lock().unwrap();
        // Millisecond precision: refresh bursts within one second must
        // still order correctly on read.
        let created_at = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO credentials
             (connection_id, payload, has_access, has_refresh, expires_at, id_token, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                credential.connection_id,
                credential.payload,
                credential.has_access as i64,
                credential.has_refresh as i64,
                credential.expires_at,
                credential.id_token,
                created_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn latest_credential(&self, connection_id: &str) -> Result<Option<CredentialRecord>> {
        let conn = self.read_conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT id, connection_id, payload, has_access, has_refresh, expires_at, id_token,
                    created_at
             FROM credentials WHERE connection_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT 1",
        )?;
        let record = stmt
            .query_row(params![connection_id], |row| {
                Ok(CredentialRecord {
                    id: row.get(0)?,
                    connection_id: row.get(1)?,
                    payload: row.get(2)?,
                    has_access: row.get::<_, i64>(3)? != 0,
                    has_refresh: row.get::<_, i64>(4)? != 0,
                    expires_at: row.get(5)?,
                    id_token: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })
            .optional()?;
        Ok(record)
    }

    fn count_credentials(&self, connection_id: &str) -> Result<usize> {
        let conn = self.read_conn.lock().unwrap();
        let count: usize = conn.query_row(
            "SELECT COUNT(*) FROM credentials WHERE connection_id = ?1",
            params![connection_id],
            |r| r.get(0),
        )?;
        Ok(count)
    }
}
