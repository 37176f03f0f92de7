use agent_memory_indexing::SearchIndex;
use agent_memory_schemas::{
    Entity, EntityFactLink, EntityId, Fact, FactId, FactStatus, Lesson, LessonId, Outcome,
    RecordKind,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::StoreLocation;
use crate::error::{MemoryError, Result};

/// Bumped whenever a table gains or loses a column.
pub const SCHEMA_VERSION: u32 = 1;

/// Columns every table must carry for the store to trust the file.
const REQUIRED_COLUMNS: &[(&str, &[&str])] = &[
    (
        "facts",
        &[
            "id",
            "content",
            "tags",
            "source",
            "confidence",
            "created_at",
            "expires_at",
            "access_count",
            "last_accessed_at",
            "status",
            "superseded_by",
        ],
    ),
    (
        "lessons",
        &[
            "id",
            "action",
            "context",
            "outcome",
            "insight",
            "created_at",
            "applied",
            "applied_at",
            "applied_count",
        ],
    ),
    (
        "entities",
        &["id", "name", "entity_type", "attributes", "created_at", "updated_at"],
    ),
    ("entity_fact_links", &["entity_id", "fact_id", "created_at"]),
    ("search_tokens", &["token", "kind", "record_id"]),
];

const FACT_COLUMNS: &str = "id, content, tags, source, confidence, created_at, expires_at,
     access_count, last_accessed_at, status, superseded_by";

const LESSON_COLUMNS: &str =
    "id, action, context, outcome, insight, created_at, applied, applied_at, applied_count";

const ENTITY_COLUMNS: &str = "id, name, entity_type, attributes, created_at, updated_at";

/// SQLite parameter budget per `IN (...)` query.
const ID_CHUNK: usize = 500;

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the backing database and make sure it is a store we
    /// can trust. Any doubt about the file is a hard error.
    pub fn open(location: &StoreLocation) -> Result<Self> {
        let conn = match location {
            StoreLocation::InMemory => Connection::open_in_memory()?,
            StoreLocation::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
        };

        let db = Self { conn };
        db.check_integrity()?;
        db.configure(location)?;
        db.init_schema()?;
        db.verify_schema()?;

        match location {
            StoreLocation::InMemory => info!("Database initialized in memory"),
            StoreLocation::File(path) => info!("Database initialized at: {}", path.display()),
        }
        Ok(db)
    }

    fn configure(&self, location: &StoreLocation) -> Result<()> {
        self.conn.pragma_update(None, "foreign_keys", true)?;
        self.conn.busy_timeout(Duration::from_secs(5))?;

        if let StoreLocation::File(_) = location {
            let mode: String = self.conn.pragma_update_and_check(
                None,
                "journal_mode",
                "WAL",
                |row| row.get(0),
            )?;
            debug!("Journal mode: {}", mode);
        }
        Ok(())
    }

    /// First read of the file: fails on anything that is not a sound SQLite database.
    fn check_integrity(&self) -> Result<()> {
        let verdict: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if verdict != "ok" {
            return Err(MemoryError::Corrupt(format!("integrity check failed: {}", verdict)));
        }
        Ok(())
    }

    /// Check if a column exists in a table
    fn has_column(&self, table: &str, column: &str) -> Result<bool> {
        let query = format!("PRAGMA table_info({})", table);
        let mut stmt = self.conn.prepare(&query)?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(columns.iter().any(|c| c == column))
    }

    pub fn schema_version(&self) -> Result<u32> {
        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(version as u32)
    }

    /// Create all tables and indexes
    fn init_schema(&self) -> Result<()> {
        let version = self.schema_version()?;
        if version > SCHEMA_VERSION {
            return Err(MemoryError::Corrupt(format!(
                "schema version {} is newer than supported version {}",
                version, SCHEMA_VERSION
            )));
        }

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS facts (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                tags TEXT NOT NULL,
                source TEXT NOT NULL,
                confidence REAL NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                access_count INTEGER NOT NULL DEFAULT 0,
                last_accessed_at TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                superseded_by TEXT REFERENCES facts(id) DEFERRABLE INITIALLY DEFERRED
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS lessons (
                id TEXT PRIMARY KEY,
                action TEXT NOT NULL,
                context TEXT NOT NULL,
                outcome TEXT NOT NULL,
                insight TEXT NOT NULL,
                created_at TEXT NOT NULL,
                applied INTEGER NOT NULL DEFAULT 0,
                applied_at TEXT,
                applied_count INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                attributes TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (name, entity_type)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS entity_fact_links (
                entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
                fact_id TEXT NOT NULL REFERENCES facts(id) ON DELETE CASCADE,
                created_at TEXT NOT NULL,
                PRIMARY KEY (entity_id, fact_id)
            )",
            [],
        )?;

        SearchIndex::new(&self.conn).init_schema()?;

        // Indexes for performance
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_facts_status ON facts(status)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_facts_created ON facts(created_at DESC)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_lessons_context ON lessons(context, outcome)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_lessons_created ON lessons(created_at DESC)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_links_fact ON entity_fact_links(fact_id)",
            [],
        )?;

        if version < SCHEMA_VERSION {
            self.conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        debug!("Database schema initialized");
        Ok(())
    }

    /// A file left behind by some other tool can have same-named tables with
    /// different shapes; refuse it rather than misread it.
    fn verify_schema(&self) -> Result<()> {
        for (table, columns) in REQUIRED_COLUMNS {
            for column in *columns {
                if !self.has_column(table, column)? {
                    return Err(MemoryError::Corrupt(format!(
                        "table '{}' is missing column '{}'",
                        table, column
                    )));
                }
            }
        }
        Ok(())
    }

    /// Run `op` inside one transaction. Commits on `Ok`; on `Err` the
    /// transaction is dropped and SQLite rolls every statement back.
    pub fn write<T, F>(&mut self, op: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let tx = self.conn.transaction()?;
        let value = op(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn read<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        op(&self.conn)
    }

    pub fn records(&self) -> Records<'_> {
        Records::new(&self.conn)
    }
}

/// Record-level reads and writes over any connection, including an open
/// transaction.
pub struct Records<'c> {
    conn: &'c Connection,
}

impl<'c> Records<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    // ========== FACTS ==========

    pub fn insert_fact(&self, fact: &Fact) -> Result<()> {
        let tags_json = serde_json::to_string(&fact.tags)?;

        self.conn.execute(
            "INSERT INTO facts (id, content, tags, source, confidence, created_at, expires_at,
                                access_count, last_accessed_at, status, superseded_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                fact.id.as_str(),
                fact.content,
                tags_json,
                fact.source.as_str(),
                fact.confidence,
                ts_to_sql(&fact.created_at),
                fact.expires_at.as_ref().map(ts_to_sql),
                count_to_sql(fact.access_count),
                fact.last_accessed_at.as_ref().map(ts_to_sql),
                fact.status.as_str(),
                fact.superseded_by.as_ref().map(|id| id.as_str()),
            ],
        )?;

        debug!("Inserted fact: {}", fact.id);
        Ok(())
    }

    pub fn fact_exists(&self, id: &FactId) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM facts WHERE id = ?1",
                params![id.as_str()],
                |_| Ok(true),
            )
            .optional()?;
        Ok(found.unwrap_or(false))
    }

    pub fn get_fact(&self, id: &FactId) -> Result<Option<Fact>> {
        let sql = format!("SELECT {} FROM facts WHERE id = ?1", FACT_COLUMNS);
        let fact = self
            .conn
            .query_row(&sql, params![id.as_str()], row_to_fact)
            .optional()?;
        Ok(fact)
    }

    /// Facts for a set of ids, in no particular order. Unknown ids are skipped.
    pub fn facts_by_ids(&self, ids: &[String]) -> Result<Vec<Fact>> {
        let mut facts = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK) {
            let sql = format!(
                "SELECT {} FROM facts WHERE id IN ({})",
                FACT_COLUMNS,
                placeholders(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(chunk.iter()), row_to_fact)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            facts.extend(rows);
        }
        Ok(facts)
    }

    /// Most recent first. Without `include_inactive`, only `active` rows.
    pub fn list_facts(&self, include_inactive: bool) -> Result<Vec<Fact>> {
        let sql = if include_inactive {
            format!("SELECT {} FROM facts ORDER BY created_at DESC, id DESC", FACT_COLUMNS)
        } else {
            format!(
                "SELECT {} FROM facts WHERE status = 'active' ORDER BY created_at DESC, id DESC",
                FACT_COLUMNS
            )
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let facts = stmt
            .query_map([], row_to_fact)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(facts)
    }

    pub fn set_fact_status(
        &self,
        id: &FactId,
        status: FactStatus,
        superseded_by: Option<&FactId>,
    ) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE facts SET status = ?1, superseded_by = ?2 WHERE id = ?3",
            params![status.as_str(), superseded_by.map(|s| s.as_str()), id.as_str()],
        )?;
        if updated == 0 {
            return Err(MemoryError::not_found(RecordKind::Fact, id.as_str()));
        }
        debug!("Fact {} is now {}", id, status.as_str());
        Ok(())
    }

    pub fn record_fact_access(&self, id: &FactId, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE facts SET access_count = access_count + 1, last_accessed_at = ?1
             WHERE id = ?2",
            params![ts_to_sql(&now), id.as_str()],
        )?;
        Ok(())
    }

    /// Active facts untouched since `cutoff` and read at most `max_access_count` times.
    pub fn stale_fact_ids(&self, cutoff: DateTime<Utc>, max_access_count: u64) -> Result<Vec<FactId>> {
        self.fact_ids_where(
            "status = 'active'
             AND COALESCE(last_accessed_at, created_at) < ?1
             AND access_count <= ?2",
            params![ts_to_sql(&cutoff), count_to_sql(max_access_count)],
        )
    }

    pub fn expired_fact_ids(&self, now: DateTime<Utc>) -> Result<Vec<FactId>> {
        self.fact_ids_where(
            "status = 'active' AND expires_at IS NOT NULL AND expires_at <= ?1",
            params![ts_to_sql(&now)],
        )
    }

    /// Superseded or deleted facts created before `cutoff`.
    pub fn purgeable_fact_ids(&self, cutoff: DateTime<Utc>) -> Result<Vec<FactId>> {
        self.fact_ids_where(
            "status != 'active' AND created_at < ?1",
            params![ts_to_sql(&cutoff)],
        )
    }

    fn fact_ids_where(&self, predicate: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<FactId>> {
        let sql = format!("SELECT id FROM facts WHERE {} ORDER BY created_at", predicate);
        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map(args, |row| Ok(FactId(row.get(0)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Facts whose `superseded_by` points at `id`.
    pub fn predecessors_of(&self, id: &FactId) -> Result<Vec<FactId>> {
        self.fact_ids_where("superseded_by = ?1", params![id.as_str()])
    }

    /// Physically remove facts. Link rows go with them through the cascade.
    pub fn delete_facts(&self, ids: &[FactId]) -> Result<usize> {
        let mut removed = 0;
        for chunk in ids.chunks(ID_CHUNK) {
            let sql = format!("DELETE FROM facts WHERE id IN ({})", placeholders(chunk.len()));
            removed += self
                .conn
                .execute(&sql, params_from_iter(chunk.iter().map(|id| id.as_str())))?;
        }
        Ok(removed)
    }

    pub fn count_facts_by_status(&self, status: FactStatus) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM facts WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn count_expired_facts(&self, now: DateTime<Utc>) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM facts
             WHERE status = 'active' AND expires_at IS NOT NULL AND expires_at <= ?1",
            params![ts_to_sql(&now)],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ========== LESSONS ==========

    pub fn insert_lesson(&self, lesson: &Lesson) -> Result<()> {
        self.conn.execute(
            "INSERT INTO lessons (id, action, context, outcome, insight, created_at,
                                  applied, applied_at, applied_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                lesson.id.as_str(),
                lesson.action,
                lesson.context,
                lesson.outcome.as_str(),
                lesson.insight,
                ts_to_sql(&lesson.created_at),
                lesson.applied,
                lesson.applied_at.as_ref().map(ts_to_sql),
                count_to_sql(lesson.applied_count),
            ],
        )?;

        debug!("Inserted lesson: {} ({})", lesson.id, lesson.outcome);
        Ok(())
    }

    pub fn lesson_exists(&self, id: &LessonId) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM lessons WHERE id = ?1",
                params![id.as_str()],
                |_| Ok(true),
            )
            .optional()?;
        Ok(found.unwrap_or(false))
    }

    pub fn get_lesson(&self, id: &LessonId) -> Result<Option<Lesson>> {
        let sql = format!("SELECT {} FROM lessons WHERE id = ?1", LESSON_COLUMNS);
        let lesson = self
            .conn
            .query_row(&sql, params![id.as_str()], row_to_lesson)
            .optional()?;
        Ok(lesson)
    }

    pub fn update_lesson_applied(&self, lesson: &Lesson) -> Result<()> {
        self.conn.execute(
            "UPDATE lessons SET applied = ?1, applied_at = ?2, applied_count = ?3 WHERE id = ?4",
            params![
                lesson.applied,
                lesson.applied_at.as_ref().map(ts_to_sql),
                count_to_sql(lesson.applied_count),
                lesson.id.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Exact-match filter, most recent first.
    pub fn list_lessons(
        &self,
        context: Option<&str>,
        outcome: Option<Outcome>,
        limit: usize,
    ) -> Result<Vec<Lesson>> {
        let sql = format!(
            "SELECT {} FROM lessons
             WHERE (?1 IS NULL OR context = ?1)
               AND (?2 IS NULL OR outcome = ?2)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3",
            LESSON_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let lessons = stmt
            .query_map(
                params![context, outcome.map(|o| o.as_str()), count_to_sql(limit as u64)],
                row_to_lesson,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(lessons)
    }

    pub fn lessons_by_ids(&self, ids: &[String]) -> Result<Vec<Lesson>> {
        let mut lessons = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK) {
            let sql = format!(
                "SELECT {} FROM lessons WHERE id IN ({})",
                LESSON_COLUMNS,
                placeholders(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(chunk.iter()), row_to_lesson)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            lessons.extend(rows);
        }
        Ok(lessons)
    }

    pub fn all_lessons(&self) -> Result<Vec<Lesson>> {
        let sql = format!("SELECT {} FROM lessons ORDER BY created_at, id", LESSON_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let lessons = stmt
            .query_map([], row_to_lesson)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(lessons)
    }

    pub fn count_lessons(&self, applied_only: bool) -> Result<usize> {
        let sql = if applied_only {
            "SELECT COUNT(*) FROM lessons WHERE applied = 1"
        } else {
            "SELECT COUNT(*) FROM lessons"
        };
        let count: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // ========== ENTITIES ==========

    pub fn insert_entity(&self, entity: &Entity) -> Result<()> {
        let attributes_json = serde_json::to_string(&entity.attributes)?;

        self.conn.execute(
            "INSERT INTO entities (id, name, entity_type, attributes, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entity.id.as_str(),
                entity.name,
                entity.entity_type,
                attributes_json,
                ts_to_sql(&entity.created_at),
                ts_to_sql(&entity.updated_at),
            ],
        )?;

        debug!("Inserted entity: {} [{}] {}", entity.id, entity.entity_type, entity.name);
        Ok(())
    }

    pub fn update_entity(&self, entity: &Entity) -> Result<()> {
        let attributes_json = serde_json::to_string(&entity.attributes)?;
        self.conn.execute(
            "UPDATE entities SET attributes = ?1, updated_at = ?2 WHERE id = ?3",
            params![attributes_json, ts_to_sql(&entity.updated_at), entity.id.as_str()],
        )?;
        Ok(())
    }

    pub fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>> {
        let sql = format!("SELECT {} FROM entities WHERE id = ?1", ENTITY_COLUMNS);
        let entity = self
            .conn
            .query_row(&sql, params![id.as_str()], row_to_entity)
            .optional()?;
        Ok(entity)
    }

    /// Lookup by natural key. `entity_type` must already be normalized.
    pub fn get_entity_by_key(&self, name: &str, entity_type: &str) -> Result<Option<Entity>> {
        let sql = format!(
            "SELECT {} FROM entities WHERE name = ?1 AND entity_type = ?2",
            ENTITY_COLUMNS
        );
        let entity = self
            .conn
            .query_row(&sql, params![name, entity_type], row_to_entity)
            .optional()?;
        Ok(entity)
    }

    /// The most recently updated entity with this name, of any type.
    pub fn get_entity_by_name(&self, name: &str) -> Result<Option<Entity>> {
        let sql = format!(
            "SELECT {} FROM entities WHERE name = ?1 ORDER BY updated_at DESC, id DESC LIMIT 1",
            ENTITY_COLUMNS
        );
        let entity = self
            .conn
            .query_row(&sql, params![name], row_to_entity)
            .optional()?;
        Ok(entity)
    }

    /// Resolve a caller-supplied reference: an entity id first, then a name.
    pub fn find_entity(&self, name_or_id: &str) -> Result<Option<Entity>> {
        if let Some(entity) = self.get_entity(&EntityId(name_or_id.to_string()))? {
            return Ok(Some(entity));
        }
        self.get_entity_by_name(name_or_id.trim())
    }

    pub fn list_entities(&self, entity_type: Option<&str>) -> Result<Vec<Entity>> {
        let sql = format!(
            "SELECT {} FROM entities
             WHERE (?1 IS NULL OR entity_type = ?1)
             ORDER BY updated_at DESC, id DESC",
            ENTITY_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let entities = stmt
            .query_map(params![entity_type], row_to_entity)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entities)
    }

    pub fn entities_by_ids(&self, ids: &[String]) -> Result<Vec<Entity>> {
        let mut entities = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK) {
            let sql = format!(
                "SELECT {} FROM entities WHERE id IN ({})",
                ENTITY_COLUMNS,
                placeholders(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(chunk.iter()), row_to_entity)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            entities.extend(rows);
        }
        Ok(entities)
    }

    pub fn count_entities(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // ========== LINKS ==========

    /// Returns `false` when the link already existed.
    pub fn insert_link(&self, link: &EntityFactLink) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO entity_fact_links (entity_id, fact_id, created_at)
             VALUES (?1, ?2, ?3)",
            params![
                link.entity_id.as_str(),
                link.fact_id.as_str(),
                ts_to_sql(&link.created_at),
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn linked_fact_ids(&self, entity_id: &EntityId) -> Result<Vec<FactId>> {
        let mut stmt = self.conn.prepare(
            "SELECT fact_id FROM entity_fact_links WHERE entity_id = ?1 ORDER BY created_at, fact_id",
        )?;
        let ids = stmt
            .query_map(params![entity_id.as_str()], |row| Ok(FactId(row.get(0)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn linked_entity_ids(&self, fact_id: &FactId) -> Result<Vec<EntityId>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_id FROM entity_fact_links WHERE fact_id = ?1 ORDER BY created_at, entity_id",
        )?;
        let ids = stmt
            .query_map(params![fact_id.as_str()], |row| Ok(EntityId(row.get(0)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn all_links(&self) -> Result<Vec<EntityFactLink>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_id, fact_id, created_at FROM entity_fact_links
             ORDER BY created_at, entity_id, fact_id",
        )?;
        let links = stmt
            .query_map([], |row| {
                Ok(EntityFactLink {
                    entity_id: EntityId(row.get(0)?),
                    fact_id: FactId(row.get(1)?),
                    created_at: ts_from_sql(row, 2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(links)
    }

    pub fn count_links(&self) -> Result<usize> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM entity_fact_links", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn row_to_fact(row: &Row) -> rusqlite::Result<Fact> {
    let tags_json: String = row.get(2)?;
    let tags: Vec<String> = serde_json::from_str(&tags_json).map_err(|e| conversion_error(2, e))?;

    let source_raw: String = row.get(3)?;
    let status_raw: String = row.get(9)?;

    Ok(Fact {
        id: FactId(row.get(0)?),
        content: row.get(1)?,
        tags,
        source: source_raw.parse().map_err(|e| conversion_error(3, e))?,
        confidence: row.get(4)?,
        created_at: ts_from_sql(row, 5)?,
        expires_at: opt_ts_from_sql(row, 6)?,
        access_count: row.get::<_, i64>(7)?.max(0) as u64,
        last_accessed_at: opt_ts_from_sql(row, 8)?,
        status: status_raw.parse().map_err(|e| conversion_error(9, e))?,
        superseded_by: row.get::<_, Option<String>>(10)?.map(FactId),
    })
}

fn row_to_lesson(row: &Row) -> rusqlite::Result<Lesson> {
    let outcome_raw: String = row.get(3)?;

    Ok(Lesson {
        id: LessonId(row.get(0)?),
        action: row.get(1)?,
        context: row.get(2)?,
        outcome: outcome_raw.parse().map_err(|e| conversion_error(3, e))?,
        insight: row.get(4)?,
        created_at: ts_from_sql(row, 5)?,
        applied: row.get(6)?,
        applied_at: opt_ts_from_sql(row, 7)?,
        applied_count: row.get::<_, i64>(8)?.max(0) as u64,
    })
}

fn row_to_entity(row: &Row) -> rusqlite::Result<Entity> {
    let attributes_json: String = row.get(3)?;

    Ok(Entity {
        id: EntityId(row.get(0)?),
        name: row.get(1)?,
        entity_type: row.get(2)?,
        attributes: serde_json::from_str(&attributes_json).map_err(|e| conversion_error(3, e))?,
        created_at: ts_from_sql(row, 4)?,
        updated_at: ts_from_sql(row, 5)?,
    })
}

/// Fixed-width UTC text, so SQL string comparison orders correctly.
pub(crate) fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_from_sql(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

fn opt_ts_from_sql(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| parse_ts(idx, &raw))
        .transpose()
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

/// Counters are unsigned in memory and signed in SQLite; clamp rather than wrap.
fn count_to_sql(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn placeholders(count: usize) -> String {
    (1..=count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}
