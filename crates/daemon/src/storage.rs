// Tunneld - Storage Module
// Durable tunnel-spec store backed by a single SQLite file

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use tunneld_common::{Error, Hop, Result, TunnelSpec, TunnelType};

/// SQLite-backed spec store keyed by tunnel id, with a unique name column
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::Internal(format!("failed to open database: {}", e)))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| Error::Internal(format!("failed to enable WAL mode: {}", e)))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("opened tunnel store at {}", path.display());
        Ok(store)
    }

    /// Idempotent schema creation plus additive migrations
    fn init_schema(&self) -> Result<()> {
        let conn = self.lock();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tunnels (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                owner TEXT NOT NULL,
                type TEXT NOT NULL,
                hops TEXT NOT NULL, -- JSON array
                local_port INTEGER NOT NULL,
                local_bind_address TEXT DEFAULT '127.0.0.1',
                remote_host TEXT NOT NULL,
                remote_port INTEGER NOT NULL,
                auto_reconnect BOOLEAN NOT NULL,
                keep_alive INTEGER NOT NULL, -- seconds
                max_retries INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(name)
            );
            CREATE INDEX IF NOT EXISTS idx_tunnels_status ON tunnels(status);
            CREATE INDEX IF NOT EXISTS idx_tunnels_owner ON tunnels(owner);
            CREATE INDEX IF NOT EXISTS idx_tunnels_created_at ON tunnels(created_at DESC);",
        )
        .map_err(|e| Error::Internal(format!("failed to create schema: {}", e)))?;

        // Migration for rows created before the bind-address column existed.
        // Re-running must succeed, so "duplicate column" counts as done.
        if let Err(e) = conn.execute(
            "ALTER TABLE tunnels ADD COLUMN local_bind_address TEXT DEFAULT '127.0.0.1'",
            [],
        ) {
            if !is_duplicate_column(&e) {
                return Err(Error::Internal(format!(
                    "failed to add local_bind_address column: {}",
                    e
                )));
            }
        }

        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("storage lock poisoned")
    }

    /// Upsert a spec. A different id with an existing name is a conflict.
    pub fn save(&self, spec: &TunnelSpec, status: &str) -> Result<()> {
        let hops_json = serde_json::to_string(&spec.hops)?;

        let result = self.lock().execute(
            "INSERT OR REPLACE INTO tunnels (
                id, name, owner, type, hops, local_port, local_bind_address,
                remote_host, remote_port, auto_reconnect, keep_alive,
                max_retries, status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                spec.id,
                spec.name,
                spec.owner,
                spec.tunnel_type.to_string(),
                hops_json,
                spec.local_port,
                spec.local_bind_address,
                spec.remote_host,
                spec.remote_port,
                spec.auto_reconnect,
                spec.keep_alive,
                spec.max_retries,
                status,
                spec.created_at.to_rfc3339(),
                spec.updated_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(Error::Conflict(format!(
                "tunnel name '{}' already exists",
                spec.name
            ))),
            Err(e) => Err(Error::Internal(format!("failed to save tunnel: {}", e))),
        }
    }

    pub fn update_status(&self, tunnel_id: &str, status: &str) -> Result<()> {
        let rows = self
            .lock()
            .execute(
                "UPDATE tunnels SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status, Utc::now().to_rfc3339(), tunnel_id],
            )
            .map_err(|e| Error::Internal(format!("failed to update status: {}", e)))?;

        if rows == 0 {
            return Err(Error::NotFound(format!("tunnel {}", tunnel_id)));
        }
        debug!("tunnel {} persisted as {}", tunnel_id, status);
        Ok(())
    }

    pub fn delete(&self, tunnel_id: &str) -> Result<()> {
        let rows = self
            .lock()
            .execute("DELETE FROM tunnels WHERE id = ?1", params![tunnel_id])
            .map_err(|e| Error::Internal(format!("failed to delete tunnel: {}", e)))?;

        if rows == 0 {
            return Err(Error::NotFound(format!("tunnel {}", tunnel_id)));
        }
        Ok(())
    }

    pub fn get(&self, tunnel_id: &str) -> Result<TunnelSpec> {
        let conn = self.lock();
        let row = conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_SPEC),
                params![tunnel_id],
                spec_from_row,
            )
            .optional()
            .map_err(|e| Error::Internal(format!("failed to get tunnel: {}", e)))?;

        row.ok_or_else(|| Error::NotFound(format!("tunnel {}", tunnel_id)))?
    }

    /// All specs, newest first
    pub fn list(&self) -> Result<Vec<TunnelSpec>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!("{} ORDER BY created_at DESC", SELECT_SPEC))
            .map_err(|e| Error::Internal(format!("failed to list tunnels: {}", e)))?;

        let rows = stmt
            .query_map([], spec_from_row)
            .map_err(|e| Error::Internal(format!("failed to list tunnels: {}", e)))?;

        let mut specs = Vec::new();
        for row in rows {
            let spec = row.map_err(|e| Error::Internal(format!("failed to scan row: {}", e)))?;
            specs.push(spec?);
        }
        Ok(specs)
    }
}

const SELECT_SPEC: &str = "SELECT id, name, owner, type, hops, local_port, local_bind_address,
        remote_host, remote_port, auto_reconnect, keep_alive, max_retries,
        created_at, updated_at
 FROM tunnels";

/// Reassemble a TunnelSpec from a row; hops come back out of the JSON blob
fn spec_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<TunnelSpec>> {
    let tunnel_type: String = row.get(3)?;
    let hops_json: String = row.get(4)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;

    Ok(build_spec(
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        tunnel_type,
        hops_json,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        created_at,
        updated_at,
    ))
}

#[allow(clippy::too_many_arguments)]
fn build_spec(
    id: String,
    name: String,
    owner: String,
    tunnel_type: String,
    hops_json: String,
    local_port: u16,
    local_bind_address: String,
    remote_host: String,
    remote_port: u16,
    auto_reconnect: bool,
    keep_alive: u64,
    max_retries: u32,
    created_at: String,
    updated_at: String,
) -> Result<TunnelSpec> {
    let tunnel_type = match tunnel_type.as_str() {
        "local" => TunnelType::Local,
        "remote" => TunnelType::Remote,
        "dynamic" => TunnelType::Dynamic,
        other => {
            return Err(Error::Internal(format!(
                "unknown tunnel type in store: {}",
                other
            )))
        }
    };

    let hops: Vec<Hop> = serde_json::from_str(&hops_json)
        .map_err(|e| Error::Internal(format!("failed to decode hops: {}", e)))?;

    Ok(TunnelSpec {
        id,
        name,
        owner,
        tunnel_type,
        hops,
        local_port,
        local_bind_address,
        remote_host,
        remote_port,
        auto_reconnect,
        keep_alive,
        max_retries,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("bad timestamp in store: {}", e)))
}

fn is_duplicate_column(e: &rusqlite::Error) -> bool {
    let msg = e.to_string();
    msg.contains("duplicate column") || msg.contains("already exists")
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(info, _)
            if info.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunneld_common::{AuthMethod, HostKeyMode};

    fn sample(id: &str, name: &str) -> TunnelSpec {
        TunnelSpec {
            id: id.into(),
            name: name.into(),
            owner: "tests".into(),
            tunnel_type: TunnelType::Local,
            hops: vec![Hop {
                host: "bastion".into(),
                port: 22,
                user: "deploy".into(),
                auth_method: AuthMethod::Key,
                key_id: Some("~/.ssh/id_ed25519".into()),
                password: None,
                host_key: HostKeyMode::KnownHosts,
            }],
            local_port: 8080,
            local_bind_address: "127.0.0.1".into(),
            remote_host: "db".into(),
            remote_port: 5432,
            auto_reconnect: true,
            keep_alive: 30,
            max_retries: 3,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("tunnels.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn save_get_round_trip_preserves_hops() {
        let (_dir, store) = open_temp();
        let spec = sample("t-1", "db");
        store.save(&spec, "pending").unwrap();

        let loaded = store.get("t-1").unwrap();
        assert_eq!(loaded.name, "db");
        assert_eq!(loaded.hops, spec.hops);
        assert_eq!(loaded.keep_alive, 30);
        assert_eq!(loaded.local_bind_address, "127.0.0.1");
    }

    #[test]
    fn get_missing_is_not_found() {
        let (_dir, store) = open_temp();
        let err = store.get("nope").unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[test]
    fn save_is_an_upsert_for_same_id() {
        let (_dir, store) = open_temp();
        let mut spec = sample("t-1", "db");
        store.save(&spec, "pending").unwrap();

        spec.remote_port = 5433;
        store.save(&spec, "active").unwrap();

        let loaded = store.get("t-1").unwrap();
        assert_eq!(loaded.remote_port, 5433);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn duplicate_name_with_other_id_conflicts() {
        let (_dir, store) = open_temp();
        store.save(&sample("t-1", "db"), "pending").unwrap();
        let err = store.save(&sample("t-2", "db"), "pending").unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[test]
    fn update_status_and_delete_report_missing_rows() {
        let (_dir, store) = open_temp();
        assert_eq!(
            store.update_status("ghost", "stopped").unwrap_err().code(),
            "NOT_FOUND"
        );
        assert_eq!(store.delete("ghost").unwrap_err().code(), "NOT_FOUND");

        store.save(&sample("t-1", "db"), "pending").unwrap();
        store.update_status("t-1", "stopped").unwrap();
        store.delete("t-1").unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn list_returns_newest_first() {
        let (_dir, store) = open_temp();
        let mut older = sample("t-old", "older");
        older.created_at = Utc::now() - chrono::Duration::hours(1);
        store.save(&older, "stopped").unwrap();
        store.save(&sample("t-new", "newer"), "stopped").unwrap();

        let specs = store.list().unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].id, "t-new");
        assert_eq!(specs[1].id, "t-old");
    }

    #[test]
    fn schema_init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnels.db");

        let first = SqliteStore::open(&path).unwrap();
        first.save(&sample("t-1", "db"), "stopped").unwrap();
        drop(first);

        // Reopening re-runs schema creation and the additive migration
        let second = SqliteStore::open(&path).unwrap();
        assert_eq!(second.list().unwrap().len(), 1);
    }
}
