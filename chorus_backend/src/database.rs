use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

use crate::persona::{PersonaDefinition, PersonaPatch};
use crate::store::{
    Direction, MessageLog, MessageRecord, PersonaStore, StoreError, StoreResult,
};

const POOL_SIZE: u32 = 8;
const BUSY_TIMEOUT_MS: u32 = 10_000;

type ConnectionPool = Pool<SqliteConnectionManager>;

#[derive(Debug)]
struct PragmaCustomizer;

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch(&format!(
            "PRAGMA busy_timeout = {};\
             PRAGMA journal_mode = WAL;\
             PRAGMA synchronous = NORMAL;",
            BUSY_TIMEOUT_MS
        ))
    }
}

/// SQLite-backed persona store and message log.
///
/// Every call checks a connection out of the pool, so appends for different
/// personas run on separate connections and SQLite arbitrates the writes.
pub struct FleetDatabase {
    pool: ConnectionPool,
}

impl FleetDatabase {
    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let manager = SqliteConnectionManager::file(path.as_ref());
        let pool = Pool::builder()
            .max_size(POOL_SIZE)
            .connection_timeout(Duration::from_secs(5))
            .connection_customizer(Box::new(PragmaCustomizer))
            .build(manager)?;

        let db = Self { pool };
        db.ensure_schema()?;
        tracing::debug!("Fleet database ready at {:?}", path.as_ref());
        Ok(db)
    }

    fn conn(&self) -> StoreResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn ensure_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS personas (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                display_name TEXT NOT NULL,
                instructions TEXT NOT NULL,
                traits TEXT NOT NULL DEFAULT '{}',
                creator TEXT NOT NULL,
                secret TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS messages (
                persona_id TEXT NOT NULL,
                event_id TEXT NOT NULL,
                room_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                ts_ms INTEGER NOT NULL,
                body TEXT NOT NULL,
                direction TEXT NOT NULL,
                system_generated INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (persona_id, event_id)
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_persona_room_ts ON messages(persona_id, room_id, ts_ms)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS sync_cursors (
                persona_id TEXT PRIMARY KEY,
                cursor TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        Ok(())
    }
}

fn timestamp_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{}': {}", raw, e)))
}

struct PersonaRow {
    id: String,
    user_id: String,
    display_name: String,
    instructions: String,
    traits: String,
    creator: String,
    secret: String,
    created_at: String,
    updated_at: String,
}

impl PersonaRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            display_name: row.get(2)?,
            instructions: row.get(3)?,
            traits: row.get(4)?,
            creator: row.get(5)?,
            secret: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_definition(self) -> StoreResult<PersonaDefinition> {
        let traits = serde_json::from_str(&self.traits).map_err(|e| {
            StoreError::Corrupt(format!("traits of persona '{}': {}", self.id, e))
        })?;
        Ok(PersonaDefinition {
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
            user_id: self.user_id,
            display_name: self.display_name,
            instructions: self.instructions,
            traits,
            creator: self.creator,
            secret: self.secret,
        })
    }
}

const PERSONA_COLUMNS: &str =
    "id, user_id, display_name, instructions, traits, creator, secret, created_at, updated_at";

fn encode_traits(definition_id: &str, traits: &impl serde::Serialize) -> StoreResult<String> {
    serde_json::to_string(traits)
        .map_err(|e| StoreError::Corrupt(format!("traits of persona '{}': {}", definition_id, e)))
}

impl PersonaStore for FleetDatabase {
    fn create(&self, definition: &PersonaDefinition) -> StoreResult<()> {
        let conn = self.conn()?;
        let traits = encode_traits(&definition.id, &definition.traits)?;
        let inserted = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO personas ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                PERSONA_COLUMNS
            ),
            params![
                definition.id,
                definition.user_id,
                definition.display_name,
                definition.instructions,
                traits,
                definition.creator,
                definition.secret,
                timestamp_text(definition.created_at),
                timestamp_text(definition.updated_at),
            ],
        )?;

        if inserted == 0 {
            return Err(StoreError::DuplicateId(definition.id.clone()));
        }
        Ok(())
    }

    fn read(&self, persona_id: &str) -> StoreResult<PersonaDefinition> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM personas WHERE id = ?1", PERSONA_COLUMNS),
                [persona_id],
                PersonaRow::from_row,
            )
            .optional()?;

        match row {
            Some(row) => row.into_definition(),
            None => Err(StoreError::NotFound(persona_id.to_string())),
        }
    }

    fn update(&self, persona_id: &str, patch: &PersonaPatch) -> StoreResult<PersonaDefinition> {
        let mut definition = self.read(persona_id)?;
        if let Some(name) = &patch.display_name {
            definition.display_name = name.clone();
        }
        if let Some(instructions) = &patch.instructions {
            definition.instructions = instructions.clone();
        }
        if let Some(traits) = &patch.traits {
            definition.traits = traits.clone();
        }
        definition.updated_at = Utc::now();

        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE personas SET display_name = ?2, instructions = ?3, traits = ?4, updated_at = ?5 WHERE id = ?1",
            params![
                persona_id,
                definition.display_name,
                definition.instructions,
                encode_traits(persona_id, &definition.traits)?,
                timestamp_text(definition.updated_at),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(persona_id.to_string()));
        }
        Ok(definition)
    }

    fn delete(&self, persona_id: &str) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM personas WHERE id = ?1", [persona_id])?;
        if removed == 0 {
            return Err(StoreError::NotFound(persona_id.to_string()));
        }
        tx.execute("DELETE FROM messages WHERE persona_id = ?1", [persona_id])?;
        tx.execute("DELETE FROM sync_cursors WHERE persona_id = ?1", [persona_id])?;
        tx.commit()?;
        Ok(())
    }

    fn list(&self) -> StoreResult<Vec<PersonaDefinition>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM personas ORDER BY id ASC",
            PERSONA_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], PersonaRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(PersonaRow::into_definition).collect()
    }

    fn is_persona_identity(&self, user_id: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM personas WHERE user_id = ?1)",
            [user_id],
            |row| row.get(0),
        )?)
    }

    fn load_cursor(&self, persona_id: &str) -> StoreResult<Option<String>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT cursor FROM sync_cursors WHERE persona_id = ?1",
                [persona_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn save_cursor(&self, persona_id: &str, cursor: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_cursors (persona_id, cursor, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(persona_id) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at",
            params![persona_id, cursor, timestamp_text(Utc::now())],
        )?;
        Ok(())
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(MessageRecord, String)> {
    let ts_ms: i64 = row.get(4)?;
    let direction: String = row.get(6)?;
    let record = MessageRecord {
        persona_id: row.get(0)?,
        event_id: row.get(1)?,
        room_id: row.get(2)?,
        sender: row.get(3)?,
        timestamp: DateTime::from_timestamp_millis(ts_ms).unwrap_or_default(),
        body: row.get(5)?,
        direction: Direction::Inbound,
        system_generated: row.get::<_, i64>(7)? != 0,
    };
    Ok((record, direction))
}

impl MessageLog for FleetDatabase {
    fn append(&self, record: &MessageRecord) -> StoreResult<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO messages
             (persona_id, event_id, room_id, sender, ts_ms, body, direction, system_generated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.persona_id,
                record.event_id,
                record.room_id,
                record.sender,
                record.timestamp.timestamp_millis(),
                record.body,
                record.direction.as_db_str(),
                record.system_generated as i64,
            ],
        )?;
        Ok(inserted > 0)
    }

    fn contains(&self, persona_id: &str, event_id: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM messages WHERE persona_id = ?1 AND event_id = ?2",
                params![persona_id, event_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn query(&self, persona_id: &str, room_id: &str) -> StoreResult<Vec<MessageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT persona_id, event_id, room_id, sender, ts_ms, body, direction, system_generated
             FROM messages
             WHERE persona_id = ?1 AND room_id = ?2
             ORDER BY ts_ms ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![persona_id, room_id], record_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(mut record, direction)| {
                record.direction = Direction::from_db(&direction).ok_or_else(|| {
                    StoreError::Corrupt(format!(
                        "direction '{}' on event {}",
                        direction, record.event_id
                    ))
                })?;
                Ok(record)
            })
            .collect()
    }

    fn recent_outbound_count(
        &self,
        persona_id: &str,
        room_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE persona_id = ?1 AND room_id = ?2 AND direction = 'outbound' AND ts_ms >= ?3",
            params![persona_id, room_id, since.timestamp_millis()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn temp_db() -> (tempfile::TempDir, FleetDatabase) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = FleetDatabase::new(dir.path().join("fleet.db")).expect("db init");
        (dir, db)
    }

    fn definition(id: &str) -> PersonaDefinition {
        let now = Utc::now();
        let mut traits = BTreeMap::new();
        traits.insert("tone".to_string(), serde_json::json!("dry"));
        PersonaDefinition {
            id: id.to_string(),
            user_id: format!("@{}:localhost", id),
            display_name: id.to_uppercase(),
            instructions: format!("You are {}.", id),
            traits,
            creator: "operator".to_string(),
            created_at: now,
            updated_at: now,
            secret: "s3cret".to_string(),
        }
    }

    fn record(persona: &str, event: &str, room: &str, offset_secs: i64) -> MessageRecord {
        MessageRecord {
            persona_id: persona.to_string(),
            event_id: event.to_string(),
            room_id: room.to_string(),
            sender: "@alice:localhost".to_string(),
            timestamp: Utc::now() + ChronoDuration::seconds(offset_secs),
            body: format!("body of {}", event),
            direction: Direction::Inbound,
            system_generated: false,
        }
    }

    #[test]
    fn persona_create_is_create_if_absent() {
        let (_dir, db) = temp_db();
        db.create(&definition("scout")).expect("first create");

        let err = db.create(&definition("scout")).expect_err("duplicate");
        assert!(matches!(err, StoreError::DuplicateId(id) if id == "scout"));

        let loaded = db.read("scout").expect("read back");
        assert_eq!(loaded.user_id, "@scout:localhost");
        assert_eq!(loaded.secret, "s3cret");
        assert_eq!(loaded.traits["tone"], serde_json::json!("dry"));
    }

    #[test]
    fn update_and_missing_persona() {
        let (_dir, db) = temp_db();
        db.create(&definition("scout")).expect("create");

        let patch = PersonaPatch {
            instructions: Some("Be terse.".to_string()),
            ..PersonaPatch::default()
        };
        let updated = db.update("scout", &patch).expect("update");
        assert_eq!(updated.instructions, "Be terse.");
        assert_eq!(db.read("scout").expect("read").instructions, "Be terse.");

        assert!(matches!(
            db.update("ghost", &patch),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(db.read("ghost"), Err(StoreError::NotFound(_))));
        assert!(!db.exists("ghost").expect("exists"));
    }

    #[test]
    fn persona_identities_are_recognized() {
        let (_dir, db) = temp_db();
        db.create(&definition("scout")).expect("create");

        assert!(db.is_persona_identity("@scout:localhost").expect("lookup"));
        assert!(!db.is_persona_identity("@alice:localhost").expect("lookup"));

        db.delete("scout").expect("delete");
        assert!(!db.is_persona_identity("@scout:localhost").expect("lookup"));
    }

    #[test]
    fn append_is_idempotent_per_persona_and_event() {
        let (_dir, db) = temp_db();
        let rec = record("scout", "$e1", "!room", 0);

        assert!(db.append(&rec).expect("first append"));
        assert!(!db.append(&rec).expect("second append"));
        assert_eq!(db.query("scout", "!room").expect("query").len(), 1);

        // Same event id under another persona is a different key.
        let other = MessageRecord {
            persona_id: "sage".to_string(),
            ..rec.clone()
        };
        assert!(db.append(&other).expect("other persona"));
        assert!(db.contains("scout", "$e1").expect("contains"));
        assert!(db.contains("sage", "$e1").expect("contains"));
        assert!(!db.contains("scout", "$e2").expect("contains"));
    }

    #[test]
    fn query_filters_room_and_orders_by_timestamp() {
        let (_dir, db) = temp_db();
        db.append(&record("scout", "$late", "!room", 30)).expect("append");
        db.append(&record("scout", "$early", "!room", -30)).expect("append");
        db.append(&record("scout", "$elsewhere", "!other", 0)).expect("append");

        let rows = db.query("scout", "!room").expect("query");
        let ids: Vec<_> = rows.iter().map(|r| r.event_id.as_str()).collect();
        assert_eq!(ids, vec!["$early", "$late"]);
    }

    #[test]
    fn delete_cascades_messages_and_cursor() {
        let (_dir, db) = temp_db();
        db.create(&definition("scout")).expect("create");
        db.append(&record("scout", "$e1", "!room", 0)).expect("append");
        db.save_cursor("scout", "s42").expect("cursor");
        assert_eq!(db.load_cursor("scout").expect("load").as_deref(), Some("s42"));

        db.delete("scout").expect("delete");
        assert!(db.query("scout", "!room").expect("query").is_empty());
        assert_eq!(db.load_cursor("scout").expect("load"), None);
        assert!(matches!(db.delete("scout"), Err(StoreError::NotFound(_))));

        // Id is reusable after deletion.
        db.create(&definition("scout")).expect("recreate");
    }

    #[test]
    fn recent_outbound_count_respects_window() {
        let (_dir, db) = temp_db();
        for (idx, offset) in [-120, -10, -5].iter().enumerate() {
            let mut rec = record("scout", &format!("$out{}", idx), "!room", *offset);
            rec.direction = Direction::Outbound;
            db.append(&rec).expect("append");
        }
        db.append(&record("scout", "$in", "!room", -1)).expect("append");

        let since = Utc::now() - ChronoDuration::seconds(60);
        assert_eq!(db.recent_outbound_count("scout", "!room", since).expect("count"), 2);
    }

    #[test]
    fn concurrent_appends_from_many_personas_keep_uniqueness() {
        let (_dir, db) = temp_db();
        let db = Arc::new(db);

        let handles: Vec<_> = (0..4)
            .map(|p| {
                let db = db.clone();
                std::thread::spawn(move || {
                    let persona = format!("p{}", p);
                    for round in 0..2 {
                        for e in 0..10 {
                            let rec = record(&persona, &format!("$e{}", e), "!room", e);
                            let inserted = db.append(&rec).expect("append");
                            assert_eq!(inserted, round == 0);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }

        for p in 0..4 {
            assert_eq!(db.query(&format!("p{}", p), "!room").expect("query").len(), 10);
        }
    }
}
