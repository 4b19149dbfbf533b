use crate::error::{Result, StoreError};
use crate::events::Event;
use crate::store::Store;
use crate::types::{Workload, WorkloadStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Executor, Row};
use std::path::Path;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workload (
    id               TEXT PRIMARY KEY,
    status           TEXT NOT NULL,
    node_id          TEXT,
    container_id     TEXT,
    ram_mb           INTEGER NOT NULL,
    port             INTEGER NOT NULL,
    requirements_json TEXT NOT NULL,
    created_at       TEXT NOT NULL,
    last_started_at  TEXT,
    last_stopped_at  TEXT,
    enqueued_at      TEXT
);
CREATE INDEX IF NOT EXISTS idx_workload_status ON workload(status);

CREATE TABLE IF NOT EXISTS event_log (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    seq          INTEGER NOT NULL,
    ts           TEXT NOT NULL,
    kind         TEXT NOT NULL,
    payload_json TEXT NOT NULL
);
"#;

/// SQLite-backed store. A single Conductor process is the only writer, so
/// the default journal mode and a small pool are plenty.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(StoreError::from)?;

        (&pool).execute(SCHEMA).await.map_err(StoreError::from)?;

        info!("💾 workload store ready at {:?}", path.as_ref());
        Ok(Self { pool })
    }

    fn row_to_workload(row: &SqliteRow) -> Result<Workload> {
        let id_text: String = row.try_get("id").map_err(StoreError::from)?;
        let id = Uuid::parse_str(&id_text).map_err(|e| StoreError::CorruptRow {
            workload_id: id_text.clone(),
            reason: format!("bad uuid: {e}"),
        })?;

        let status_text: String = row.try_get("status").map_err(StoreError::from)?;
        let status =
            WorkloadStatus::from_str(&status_text).map_err(|reason| StoreError::CorruptRow {
                workload_id: id_text.clone(),
                reason,
            })?;

        let requirements_text: String =
            row.try_get("requirements_json").map_err(StoreError::from)?;
        let requirements: serde_json::Value =
            serde_json::from_str(&requirements_text).map_err(|e| StoreError::CorruptRow {
                workload_id: id_text.clone(),
                reason: format!("bad requirements_json: {e}"),
            })?;
        let cpu_share = requirements["cpu_share"].as_u64().unwrap_or(1) as u32;

        Ok(Workload {
            id,
            ram_mb: row.try_get::<i64, _>("ram_mb").map_err(StoreError::from)? as u64,
            cpu_share,
            port: row.try_get::<i64, _>("port").map_err(StoreError::from)? as u16,
            node_id: row.try_get("node_id").map_err(StoreError::from)?,
            container_id: row.try_get("container_id").map_err(StoreError::from)?,
            status,
            created_at: row
                .try_get::<DateTime<Utc>, _>("created_at")
                .map_err(StoreError::from)?,
            last_started_at: row
                .try_get::<Option<DateTime<Utc>>, _>("last_started_at")
                .map_err(StoreError::from)?,
            last_stopped_at: row
                .try_get::<Option<DateTime<Utc>>, _>("last_stopped_at")
                .map_err(StoreError::from)?,
            enqueued_at: row
                .try_get::<Option<DateTime<Utc>>, _>("enqueued_at")
                .map_err(StoreError::from)?,
        })
    }

    fn requirements_json(workload: &Workload) -> String {
        serde_json::json!({ "cpu_share": workload.cpu_share }).to_string()
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_workload(&self, workload: &Workload) -> Result<()> {
        sqlx::query(
            "INSERT INTO workload \
             (id, status, node_id, container_id, ram_mb, port, requirements_json, \
              created_at, last_started_at, last_stopped_at, enqueued_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(workload.id.to_string())
        .bind(workload.status.to_string())
        .bind(&workload.node_id)
        .bind(&workload.container_id)
        .bind(workload.ram_mb as i64)
        .bind(workload.port as i64)
        .bind(Self::requirements_json(workload))
        .bind(workload.created_at)
        .bind(workload.last_started_at)
        .bind(workload.last_stopped_at)
        .bind(workload.enqueued_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn update_workload(&self, workload: &Workload) -> Result<()> {
        sqlx::query(
            "UPDATE workload SET status = ?, node_id = ?, container_id = ?, ram_mb = ?, \
             port = ?, requirements_json = ?, last_started_at = ?, last_stopped_at = ?, \
             enqueued_at = ? WHERE id = ?",
        )
        .bind(workload.status.to_string())
        .bind(&workload.node_id)
        .bind(&workload.container_id)
        .bind(workload.ram_mb as i64)
        .bind(workload.port as i64)
        .bind(Self::requirements_json(workload))
        .bind(workload.last_started_at)
        .bind(workload.last_stopped_at)
        .bind(workload.enqueued_at)
        .bind(workload.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn get_workload(&self, id: Uuid) -> Result<Option<Workload>> {
        let row = sqlx::query("SELECT * FROM workload WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;
        row.map(|r| Self::row_to_workload(&r)).transpose()
    }

    async fn list_workloads(&self) -> Result<Vec<Workload>> {
        let rows = sqlx::query("SELECT * FROM workload ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from)?;
        rows.iter().map(Self::row_to_workload).collect()
    }

    async fn list_by_status(&self, status: WorkloadStatus) -> Result<Vec<Workload>> {
        let rows = sqlx::query("SELECT * FROM workload WHERE status = ? ORDER BY created_at")
            .bind(status.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from)?;
        rows.iter().map(Self::row_to_workload).collect()
    }

    async fn delete_workload(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM workload WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn queued_in_order(&self) -> Result<Vec<Workload>> {
        let rows = sqlx::query(
            "SELECT * FROM workload WHERE status = 'queued' ORDER BY enqueued_at, created_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;
        rows.iter().map(Self::row_to_workload).collect()
    }

    async fn append_event(&self, event: &Event) -> Result<()> {
        sqlx::query("INSERT INTO event_log (seq, ts, kind, payload_json) VALUES (?, ?, ?, ?)")
            .bind(event.seq as i64)
            .bind(event.timestamp)
            .bind(event.kind.as_str())
            .bind(event.payload.to_string())
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn workload() -> Workload {
        Workload {
            id: Uuid::new_v4(),
            ram_mb: 2048,
            cpu_share: 2,
            port: 25600,
            node_id: None,
            container_id: None,
            status: WorkloadStatus::Queued,
            created_at: Utc::now(),
            last_started_at: None,
            last_stopped_at: None,
            enqueued_at: Some(Utc::now()),
        }
    }

    async fn open_temp() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("test.db")).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn workload_rows_round_trip() {
        let (store, _dir) = open_temp().await;
        let mut w = workload();
        store.insert_workload(&w).await.unwrap();

        let loaded = store.get_workload(w.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, w.id);
        assert_eq!(loaded.cpu_share, 2);
        assert_eq!(loaded.status, WorkloadStatus::Queued);

        w.status = WorkloadStatus::Running;
        w.node_id = Some("local-node".to_string());
        w.container_id = Some("abc123".to_string());
        store.update_workload(&w).await.unwrap();

        let loaded = store.get_workload(w.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkloadStatus::Running);
        assert_eq!(loaded.node_id.as_deref(), Some("local-node"));

        store.delete_workload(w.id).await.unwrap();
        assert!(store.get_workload(w.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn queued_rows_come_back_oldest_first() {
        let (store, _dir) = open_temp().await;
        let mut older = workload();
        older.enqueued_at = Some(Utc::now() - chrono::Duration::seconds(60));
        let newer = workload();
        store.insert_workload(&newer).await.unwrap();
        store.insert_workload(&older).await.unwrap();

        let queued = store.queued_in_order().await.unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].id, older.id);
        assert_eq!(queued[1].id, newer.id);
    }

    #[tokio::test]
    async fn events_append() {
        let (store, _dir) = open_temp().await;
        let event = Event {
            seq: 7,
            kind: crate::events::EventKind::WorkloadStarted,
            timestamp: Utc::now(),
            payload: serde_json::json!({ "workload_id": Uuid::new_v4() }),
        };
        assert_ok!(store.append_event(&event).await);
    }
}
