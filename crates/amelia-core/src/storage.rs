use std::path::Path;
use std::str::FromStr;

use amelia_types::{
    DeviceID, PairedDevice, PairingToken, Profile, ProfileID, WorkflowEvent, WorkflowID,
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

/// Event log + state checkpoints + profile/device/pairing stores, all
/// behind one SQLite pool (§4.7, §6.4). `sqlx` is used with runtime
/// queries (`sqlx::query`, not the `query!` macro) so the crate builds
/// without a live database at compile time.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn connect(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))?
                .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .context("failed to open sqlite database")?;
        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                agent TEXT NOT NULL,
                event_type TEXT NOT NULL,
                level TEXT,
                message TEXT NOT NULL,
                data_json TEXT NOT NULL,
                correlation_id TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_events_workflow_sequence \
             ON events (workflow_id, sequence);",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events (timestamp);")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                workflow_id TEXT NOT NULL,
                step INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                state_json TEXT NOT NULL,
                PRIMARY KEY (workflow_id, step)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS profiles (
                id TEXT PRIMARY KEY,
                profile_json TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS paired_devices (
                id TEXT PRIMARY KEY,
                device_token_hash TEXT NOT NULL,
                device_name TEXT NOT NULL,
                device_model TEXT,
                paired_at TEXT NOT NULL,
                last_seen TEXT,
                revoked_at TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pairing_tokens (
                token_hash TEXT PRIMARY KEY,
                expires_at TEXT NOT NULL,
                used_at TEXT,
                used_by_device_id TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // -- Event log ---------------------------------------------------

    /// Writes to the event log are serialized per-workflow by the caller
    /// (the graph engine holds one advancing frontier per workflow_id), so
    /// `sequence` stays monotonic with no gaps (§5, §8 invariant 4).
    pub async fn append_event(&self, event: &WorkflowEvent) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO events \
             (id, workflow_id, sequence, timestamp, agent, event_type, level, message, data_json, correlation_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.id)
        .bind(event.workflow_id.as_str())
        .bind(event.sequence as i64)
        .bind(event.timestamp.to_rfc3339())
        .bind(&event.agent)
        .bind(&event.event_type)
        .bind(event.level.map(|l| format!("{:?}", l).to_lowercase()))
        .bind(&event.message)
        .bind(serde_json::to_string(&event.data)?)
        .bind(&event.correlation_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn next_sequence(&self, workflow_id: &WorkflowID) -> anyhow::Result<u64> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(sequence), 0) as max_seq FROM events WHERE workflow_id = ?",
        )
        .bind(workflow_id.as_str())
        .fetch_one(&self.pool)
        .await?;
        let max_seq: i64 = row.try_get("max_seq")?;
        Ok(max_seq as u64 + 1)
    }

    /// Looks up an event by id, returning its sequence if still present
    /// (i.e. not swept by retention) — used by reconnect-backfill (§4.6).
    pub async fn find_event_sequence(
        &self,
        workflow_id: &WorkflowID,
        event_id: &str,
    ) -> anyhow::Result<Option<u64>> {
        let row = sqlx::query("SELECT sequence FROM events WHERE workflow_id = ? AND id = ?")
            .bind(workflow_id.as_str())
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("sequence") as u64))
    }

    /// Looks up an event by its globally unique id alone, with no
    /// `workflow_id` known ahead of time — the connection-manager's entry
    /// point for `?since=<event_id>` reconnect-backfill (§4.6), which
    /// resolves which workflow to replay from the event itself.
    pub async fn find_event_by_id(&self, event_id: &str) -> anyhow::Result<Option<WorkflowEvent>> {
        let row = sqlx::query("SELECT * FROM events WHERE id = ?")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_event).transpose()
    }

    /// All events for `workflow_id` with `sequence` strictly greater than
    /// `after`, ordered by `sequence` ascending — the backfill payload.
    pub async fn events_after(
        &self,
        workflow_id: &WorkflowID,
        after: u64,
    ) -> anyhow::Result<Vec<WorkflowEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM events WHERE workflow_id = ? AND sequence > ? ORDER BY sequence ASC",
        )
        .bind(workflow_id.as_str())
        .bind(after as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_event).collect()
    }

    /// Time + count retention sweep (§4.7). Returns the number of rows
    /// removed.
    pub async fn sweep_events(
        &self,
        older_than: DateTime<Utc>,
        per_workflow_count_cap: Option<u64>,
    ) -> anyhow::Result<u64> {
        let by_age = sqlx::query("DELETE FROM events WHERE timestamp < ?")
            .bind(older_than.to_rfc3339())
            .execute(&self.pool)
            .await?
            .rows_affected();

        let mut by_count = 0u64;
        if let Some(cap) = per_workflow_count_cap {
            let workflow_ids: Vec<String> = sqlx::query("SELECT DISTINCT workflow_id FROM events")
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|r| r.get::<String, _>("workflow_id"))
                .collect();
            for workflow_id in workflow_ids {
                let result = sqlx::query(
                    "DELETE FROM events WHERE workflow_id = ? AND sequence NOT IN \
                     (SELECT sequence FROM events WHERE workflow_id = ? \
                      ORDER BY sequence DESC LIMIT ?)",
                )
                .bind(&workflow_id)
                .bind(&workflow_id)
                .bind(cap as i64)
                .execute(&self.pool)
                .await?;
                by_count += result.rows_affected();
            }
        }

        Ok(by_age + by_count)
    }

    // -- Checkpoints ---------------------------------------------------

    pub async fn save_checkpoint(
        &self,
        workflow_id: &WorkflowID,
        step: u64,
        state: &amelia_types::ExecutionState,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO checkpoints (workflow_id, step, created_at, state_json) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(workflow_id.as_str())
        .bind(step as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(serde_json::to_string(state)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Enables resume without re-executing prior nodes (§4.7 resume contract).
    pub async fn load_latest_checkpoint(
        &self,
        workflow_id: &WorkflowID,
    ) -> anyhow::Result<Option<(u64, amelia_types::ExecutionState)>> {
        let row = sqlx::query(
            "SELECT step, state_json FROM checkpoints WHERE workflow_id = ? \
             ORDER BY step DESC LIMIT 1",
        )
        .bind(workflow_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let step: i64 = row.try_get("step")?;
                let state_json: String = row.try_get("state_json")?;
                Ok(Some((step as u64, serde_json::from_str(&state_json)?)))
            }
        }
    }

    /// Full history newest-first, for time-travel inspection (§4.7, GLOSSARY).
    pub async fn checkpoint_history(
        &self,
        workflow_id: &WorkflowID,
    ) -> anyhow::Result<Vec<(u64, DateTime<Utc>, amelia_types::ExecutionState)>> {
        let rows = sqlx::query(
            "SELECT step, created_at, state_json FROM checkpoints WHERE workflow_id = ? \
             ORDER BY step DESC",
        )
        .bind(workflow_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let step: i64 = row.try_get("step")?;
                let created_at: String = row.try_get("created_at")?;
                let state_json: String = row.try_get("state_json")?;
                Ok((
                    step as u64,
                    DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
                    serde_json::from_str(&state_json)?,
                ))
            })
            .collect()
    }

    // -- Profiles ---------------------------------------------------

    pub async fn put_profile(&self, profile: &Profile) -> anyhow::Result<()> {
        sqlx::query("INSERT OR REPLACE INTO profiles (id, profile_json) VALUES (?, ?)")
            .bind(&profile.name)
            .bind(serde_json::to_string(profile)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_profile(&self, id: &ProfileID) -> anyhow::Result<Option<Profile>> {
        let row = sqlx::query("SELECT profile_json FROM profiles WHERE id = ?")
            .bind(id.0.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let json: String = row.try_get("profile_json")?;
                Ok(Some(serde_json::from_str(&json)?))
            }
        }
    }

    // -- Paired devices ---------------------------------------------------

    pub async fn put_device(
        &self,
        device: &PairedDevice,
        device_token_hash: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO paired_devices \
             (id, device_token_hash, device_name, device_model, paired_at, last_seen, revoked_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(device.id.as_str())
        .bind(device_token_hash)
        .bind(&device.device_name)
        .bind(&device.device_model)
        .bind(device.paired_at.to_rfc3339())
        .bind(device.last_seen.map(|t| t.to_rfc3339()))
        .bind(device.revoked_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_devices(&self) -> anyhow::Result<Vec<PairedDevice>> {
        let rows = sqlx::query("SELECT * FROM paired_devices")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_device).collect()
    }

    /// Finds the device whose stored bcrypt hash matches `token`. Used by
    /// the auth layer on every request carrying a device token (§4.7,
    /// §8 invariant 6).
    pub async fn find_device_by_token(&self, token: &str) -> anyhow::Result<Option<PairedDevice>> {
        let rows = sqlx::query("SELECT * FROM paired_devices")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let hash: String = row.try_get("device_token_hash")?;
            if bcrypt::verify(token, &hash).unwrap_or(false) {
                return Ok(Some(row_to_device(row)?));
            }
        }
        Ok(None)
    }

    /// Atomic revoke: subsequent `find_device_by_token` calls see the
    /// device as revoked immediately (§4.7, §8 invariant 6).
    pub async fn revoke_device(&self, id: &DeviceID) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE paired_devices SET revoked_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // -- Pairing tokens ---------------------------------------------------

    pub async fn put_pairing_token(&self, token: &PairingToken) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO pairing_tokens (token_hash, expires_at, used_at, used_by_device_id) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&token.token_hash)
        .bind(token.expires_at.to_rfc3339())
        .bind(token.used_at.map(|t| t.to_rfc3339()))
        .bind(
            token
                .used_by_device_id
                .as_ref()
                .map(|d| d.as_str().to_string()),
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_pairing_token(
        &self,
        token_hash: &str,
    ) -> anyhow::Result<Option<PairingToken>> {
        let row = sqlx::query("SELECT * FROM pairing_tokens WHERE token_hash = ?")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_pairing_token).transpose()
    }

    /// Marks a pairing token used, returning `false` if it was already
    /// used or expired (single-use, 60s TTL — §4.7, §6.1).
    pub async fn consume_pairing_token(
        &self,
        token_hash: &str,
        device_id: &DeviceID,
    ) -> anyhow::Result<bool> {
        let Some(token) = self.get_pairing_token(token_hash).await? else {
            return Ok(false);
        };
        if token.is_used() || token.is_expired(Utc::now()) {
            return Ok(false);
        }
        let result = sqlx::query(
            "UPDATE pairing_tokens SET used_at = ?, used_by_device_id = ? \
             WHERE token_hash = ? AND used_at IS NULL",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(device_id.as_str())
        .bind(token_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Swept hourly per §4.7.
    pub async fn sweep_expired_pairing_tokens(&self) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM pairing_tokens WHERE expires_at < ?")
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_event(row: sqlx::sqlite::SqliteRow) -> anyhow::Result<WorkflowEvent> {
    let data_json: String = row.try_get("data_json")?;
    let level: Option<String> = row.try_get("level")?;
    Ok(WorkflowEvent {
        id: row.try_get("id")?,
        domain: amelia_types::EventDomain::Workflow,
        workflow_id: WorkflowID::from(row.try_get::<String, _>("workflow_id")?),
        sequence: row.try_get::<i64, _>("sequence")? as u64,
        timestamp: DateTime::parse_from_rfc3339(&row.try_get::<String, _>("timestamp")?)?
            .with_timezone(&Utc),
        agent: row.try_get("agent")?,
        event_type: row.try_get("event_type")?,
        level: level.and_then(|l| match l.as_str() {
            "info" => Some(amelia_types::EventLevel::Info),
            "debug" => Some(amelia_types::EventLevel::Debug),
            "error" => Some(amelia_types::EventLevel::Error),
            _ => None,
        }),
        message: row.try_get("message")?,
        data: serde_json::from_str::<Value>(&data_json)?
            .as_object()
            .cloned()
            .unwrap_or_default(),
        correlation_id: row.try_get("correlation_id")?,
    })
}

fn row_to_device(row: sqlx::sqlite::SqliteRow) -> anyhow::Result<PairedDevice> {
    Ok(PairedDevice {
        id: DeviceID::from(row.try_get::<String, _>("id")?),
        device_name: row.try_get("device_name")?,
        device_model: row.try_get("device_model")?,
        paired_at: DateTime::parse_from_rfc3339(&row.try_get::<String, _>("paired_at")?)?
            .with_timezone(&Utc),
        last_seen: row
            .try_get::<Option<String>, _>("last_seen")?
            .map(|t| DateTime::parse_from_rfc3339(&t).map(|d| d.with_timezone(&Utc)))
            .transpose()?,
        revoked_at: row
            .try_get::<Option<String>, _>("revoked_at")?
            .map(|t| DateTime::parse_from_rfc3339(&t).map(|d| d.with_timezone(&Utc)))
            .transpose()?,
    })
}

fn row_to_pairing_token(row: sqlx::sqlite::SqliteRow) -> anyhow::Result<PairingToken> {
    Ok(PairingToken {
        token_hash: row.try_get("token_hash")?,
        expires_at: DateTime::parse_from_rfc3339(&row.try_get::<String, _>("expires_at")?)?
            .with_timezone(&Utc),
        used_at: row
            .try_get::<Option<String>, _>("used_at")?
            .map(|t| DateTime::parse_from_rfc3339(&t).map(|d| d.with_timezone(&Utc)))
            .transpose()?,
        used_by_device_id: row
            .try_get::<Option<String>, _>("used_by_device_id")?
            .map(DeviceID::from),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use amelia_types::{ExecutionState, Issue, WorkflowStatus};
    use serde_json::Map;

    async fn storage() -> Storage {
        Storage::in_memory().await.unwrap()
    }

    fn event(workflow_id: &WorkflowID, sequence: u64) -> WorkflowEvent {
        WorkflowEvent::new(
            workflow_id.clone(),
            sequence,
            "architect",
            "plan_drafted",
            "drafted",
            Map::new(),
        )
    }

    #[tokio::test]
    async fn append_and_backfill_events_in_sequence_order() {
        let storage = storage().await;
        let workflow_id = WorkflowID::from("wf-1");
        for seq in 1..=5 {
            storage.append_event(&event(&workflow_id, seq)).await.unwrap();
        }
        let after = storage.events_after(&workflow_id, 2).await.unwrap();
        let sequences: Vec<u64> = after.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn find_event_sequence_is_none_when_swept() {
        let storage = storage().await;
        let workflow_id = WorkflowID::from("wf-1");
        storage.append_event(&event(&workflow_id, 1)).await.unwrap();
        assert!(storage
            .find_event_sequence(&workflow_id, "nonexistent")
            .await
            .unwrap()
            .is_none());
    }

    /// Reconnect backfill (§4.6, §8): a client that saw evt-1..evt-5 and
    /// reconnects with `?since=<evt-5 id>` must see evt-6..evt-10, in
    /// order, and nothing from before the disconnect.
    #[tokio::test]
    async fn reconnecting_with_since_replays_only_events_after_it() {
        let storage = storage().await;
        let workflow_id = WorkflowID::from("wf-1");
        let mut events = Vec::new();
        for seq in 1..=10 {
            let e = event(&workflow_id, seq);
            storage.append_event(&e).await.unwrap();
            events.push(e);
        }

        let since_id = &events[4].id;
        let seq = storage
            .find_event_sequence(&workflow_id, since_id)
            .await
            .unwrap()
            .expect("evt-5 is still present");
        assert_eq!(seq, 5);

        let backfill = storage.events_after(&workflow_id, seq).await.unwrap();
        let sequences: Vec<u64> = backfill.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (6..=10).collect::<Vec<_>>());
        assert_eq!(backfill.len(), 5);
    }

    #[tokio::test]
    async fn checkpoint_round_trips_and_resumes_latest() {
        let storage = storage().await;
        let workflow_id = WorkflowID::from("wf-1");
        let mut state = ExecutionState::init(
            workflow_id.clone(),
            ProfileID::from("default"),
            Issue {
                id: "T-1".into(),
                title: "t".into(),
                description: "d".into(),
            },
        );
        storage.save_checkpoint(&workflow_id, 1, &state).await.unwrap();
        state.workflow_status = WorkflowStatus::Completed;
        storage.save_checkpoint(&workflow_id, 2, &state).await.unwrap();

        let (step, loaded) = storage
            .load_latest_checkpoint(&workflow_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(step, 2);
        assert_eq!(loaded.workflow_status, WorkflowStatus::Completed);

        let history = storage.checkpoint_history(&workflow_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].0, 2);
    }

    #[tokio::test]
    async fn revoked_device_is_rejected_on_next_lookup() {
        let storage = storage().await;
        let device = PairedDevice {
            id: DeviceID::from("dev-1"),
            device_name: "phone".into(),
            device_model: None,
            paired_at: Utc::now(),
            last_seen: None,
            revoked_at: None,
        };
        let hash = bcrypt::hash("secret-token", bcrypt::DEFAULT_COST).unwrap();
        storage.put_device(&device, &hash).await.unwrap();

        assert!(storage
            .find_device_by_token("secret-token")
            .await
            .unwrap()
            .is_some());

        storage.revoke_device(&device.id).await.unwrap();
        let devices = storage.list_devices().await.unwrap();
        assert!(devices[0].is_revoked());
    }

    #[tokio::test]
    async fn pairing_token_is_single_use() {
        let storage = storage().await;
        let token = PairingToken {
            token_hash: "hash-1".into(),
            expires_at: Utc::now() + chrono::Duration::seconds(60),
            used_at: None,
            used_by_device_id: None,
        };
        storage.put_pairing_token(&token).await.unwrap();

        let first = storage
            .consume_pairing_token("hash-1", &DeviceID::from("dev-1"))
            .await
            .unwrap();
        assert!(first);

        let second = storage
            .consume_pairing_token("hash-1", &DeviceID::from("dev-2"))
            .await
            .unwrap();
        assert!(!second);
    }

    #[tokio::test]
    async fn expired_pairing_token_is_rejected() {
        let storage = storage().await;
        let token = PairingToken {
            token_hash: "hash-expired".into(),
            expires_at: Utc::now() - chrono::Duration::seconds(1),
            used_at: None,
            used_by_device_id: None,
        };
        storage.put_pairing_token(&token).await.unwrap();
        let consumed = storage
            .consume_pairing_token("hash-expired", &DeviceID::from("dev-1"))
            .await
            .unwrap();
        assert!(!consumed);
    }

    #[tokio::test]
    async fn sweep_removes_expired_tokens() {
        let storage = storage().await;
        let token = PairingToken {
            token_hash: "hash-old".into(),
            expires_at: Utc::now() - chrono::Duration::seconds(1),
            used_at: None,
            used_by_device_id: None,
        };
        storage.put_pairing_token(&token).await.unwrap();
        let removed = storage.sweep_expired_pairing_tokens().await.unwrap();
        assert_eq!(removed, 1);
    }
}
