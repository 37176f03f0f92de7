use agent_memory_indexing::SearchIndex;
use agent_memory_schemas::{
    normalize_entity_type, normalize_tags, Attributes, Entity, EntityFactLink, Fact, FactId,
    FactUpdate, ImportReport, Lesson, LessonId, MemorySnapshot, MemoryStats, NewFact, NewLesson,
    RecordKind, FactStatus,
};
use chrono::{DateTime, SubsecRound, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::database::{Database, Records};
use crate::error::{MemoryError, Result};
use crate::export;
use crate::recall::{self, lesson_search_text, LessonFilter, RecallQuery, ScoredEntity, ScoredFact, ScoredLesson};
use crate::retention;

/// Source of "now" for every timestamp the store writes.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Handle to one memory store. Cheap to share behind an `Arc`; every
/// operation locks the single connection for its duration.
pub struct MemoryStore {
    db: Mutex<Database>,
    clock: Clock,
    config: StoreConfig,
}

impl MemoryStore {
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::open_with_clock(config, system_clock())
    }

    pub fn open_with_clock(config: StoreConfig, clock: Clock) -> Result<Self> {
        config.validate()?;
        let db = Database::open(&config.location)?;
        info!("Memory store opened ({:?})", config.location);

        Ok(Self {
            db: Mutex::new(db),
            clock,
            config,
        })
    }

    /// Release the connection. Everything committed is already durable.
    pub fn close(self) -> Result<()> {
        let db = self.db.into_inner().map_err(|_| MemoryError::LockPoisoned)?;
        drop(db);
        info!("Memory store closed");
        Ok(())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Stored timestamps carry microseconds; match that so returned records
    /// equal what a later read produces.
    fn now(&self) -> DateTime<Utc> {
        (self.clock)().trunc_subsecs(6)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Database>> {
        self.db.lock().map_err(|_| MemoryError::LockPoisoned)
    }

    // ========== FACTS ==========

    pub fn remember(&self, draft: NewFact) -> Result<Fact> {
        let draft = retention::with_default_expiry(draft, self.config.default_expiry_days);
        let fact = Fact::new(draft, self.now())?;

        self.lock()?.write(|tx| retention::insert_fact(tx, &fact))?;
        info!("Remembered fact {}", fact.id);
        Ok(fact)
    }

    pub fn recall(&self, query: &RecallQuery) -> Result<Vec<ScoredFact>> {
        let now = self.now();
        self.lock()?
            .write(|tx| recall::recall(tx, query, &self.config.ranking, now))
    }

    pub fn get_fact(&self, id: &FactId) -> Result<Fact> {
        self.lock()?
            .records()
            .get_fact(id)?
            .ok_or_else(|| MemoryError::not_found(RecordKind::Fact, id.as_str()))
    }

    /// Most recent first. Tag filtering matches any of `tags`.
    pub fn list_facts(&self, tags: &[String], limit: usize, include_inactive: bool) -> Result<Vec<Fact>> {
        let wanted = normalize_tags(tags)?;
        let facts = self.lock()?.records().list_facts(include_inactive)?;

        Ok(facts
            .into_iter()
            .filter(|fact| wanted.is_empty() || fact.has_any_tag(&wanted))
            .take(limit)
            .collect())
    }

    pub fn supersede(&self, old_id: &FactId, update: FactUpdate) -> Result<Fact> {
        let now = self.now();
        let expiry = self.config.default_expiry_days;
        self.lock()?
            .write(|tx| retention::supersede(tx, old_id, update, expiry, now))
    }

    pub fn forget(&self, id: &FactId) -> Result<Fact> {
        self.lock()?.write(|tx| retention::forget(tx, id))
    }

    pub fn forget_stale(&self, days: u32, min_access_count: u64) -> Result<usize> {
        let now = self.now();
        self.lock()?
            .write(|tx| retention::forget_stale(tx, days, min_access_count, now))
    }

    pub fn sweep_expired(&self) -> Result<usize> {
        let now = self.now();
        self.lock()?.write(|tx| retention::sweep_expired(tx, now))
    }

    pub fn purge(&self, older_than_days: u32) -> Result<usize> {
        let now = self.now();
        self.lock()?
            .write(|tx| retention::purge(tx, older_than_days, now))
    }

    // ========== LESSONS ==========

    pub fn learn(&self, draft: NewLesson) -> Result<Lesson> {
        let lesson = Lesson::new(draft, self.now())?;

        self.lock()?.write(|tx| {
            Records::new(tx).insert_lesson(&lesson)?;
            SearchIndex::new(tx).index_record(
                RecordKind::Lesson,
                lesson.id.as_str(),
                &lesson_search_text(&lesson),
            )?;
            Ok(())
        })?;
        info!("Learned lesson {} in '{}'", lesson.id, lesson.context);
        Ok(lesson)
    }

    pub fn get_lessons(&self, filter: &LessonFilter) -> Result<Vec<Lesson>> {
        self.lock()?.read(|conn| recall::get_lessons(conn, filter))
    }

    pub fn search_lessons(&self, query: &str, limit: usize) -> Result<Vec<ScoredLesson>> {
        let now = self.now();
        self.lock()?
            .read(|conn| recall::search_lessons(conn, query, limit, &self.config.ranking, now))
    }

    pub fn apply_lesson(&self, id: &LessonId) -> Result<Lesson> {
        let now = self.now();
        self.lock()?.write(|tx| {
            let records = Records::new(tx);
            let mut lesson = records
                .get_lesson(id)?
                .ok_or_else(|| MemoryError::not_found(RecordKind::Lesson, id.as_str()))?;
            lesson.mark_applied(now);
            records.update_lesson_applied(&lesson)?;
            debug!("Lesson {} applied {} times", lesson.id, lesson.applied_count);
            Ok(lesson)
        })
    }

    // ========== ENTITIES ==========

    /// Create the entity or merge `attributes` into the existing one with the
    /// same name and type.
    pub fn track_entity(&self, name: &str, entity_type: &str, attributes: Attributes) -> Result<Entity> {
        let now = self.now();
        let candidate = Entity::new(name, entity_type, attributes, now)?;

        self.lock()?.write(|tx| {
            let records = Records::new(tx);
            match records.get_entity_by_key(&candidate.name, &candidate.entity_type)? {
                Some(mut existing) => {
                    existing.merge_attributes(candidate.attributes, now)?;
                    records.update_entity(&existing)?;
                    debug!("Merged attributes into entity {}", existing.id);
                    Ok(existing)
                }
                None => {
                    records.insert_entity(&candidate)?;
                    SearchIndex::new(tx).index_record(
                        RecordKind::Entity,
                        candidate.id.as_str(),
                        &candidate.name,
                    )?;
                    info!("Tracking entity {} [{}] {}", candidate.id, candidate.entity_type, candidate.name);
                    Ok(candidate)
                }
            }
        })
    }

    /// Merge into an entity that must already exist.
    pub fn update_entity(&self, name: &str, entity_type: &str, attributes: Attributes) -> Result<Entity> {
        let now = self.now();
        let key_type = normalize_entity_type(entity_type)?;
        let name = name.trim();

        self.lock()?.write(|tx| {
            let records = Records::new(tx);
            let mut entity = records
                .get_entity_by_key(name, &key_type)?
                .ok_or_else(|| {
                    MemoryError::not_found(RecordKind::Entity, format!("{} ({})", name, key_type))
                })?;
            entity.merge_attributes(attributes, now)?;
            records.update_entity(&entity)?;
            Ok(entity)
        })
    }

    /// Exact lookup by name; without a type, the most recently updated match.
    pub fn get_entity(&self, name: &str, entity_type: Option<&str>) -> Result<Entity> {
        let name = name.trim();
        let key_type = entity_type.map(normalize_entity_type).transpose()?;

        let db = self.lock()?;
        let records = db.records();
        let found = match &key_type {
            Some(key_type) => records.get_entity_by_key(name, key_type)?,
            None => records.get_entity_by_name(name)?,
        };
        found.ok_or_else(|| MemoryError::not_found(RecordKind::Entity, name))
    }

    pub fn list_entities(&self, entity_type: Option<&str>) -> Result<Vec<Entity>> {
        let key_type = entity_type.map(normalize_entity_type).transpose()?;
        self.lock()?.records().list_entities(key_type.as_deref())
    }

    pub fn find_entities(&self, query: &str, limit: usize) -> Result<Vec<ScoredEntity>> {
        let now = self.now();
        self.lock()?
            .read(|conn| recall::find_entities(conn, query, limit, &self.config.ranking, now))
    }

    /// Returns `false` when the link was already there.
    pub fn link_fact_to_entity(&self, name_or_id: &str, fact_id: &FactId) -> Result<bool> {
        let now = self.now();
        self.lock()?.write(|tx| {
            let records = Records::new(tx);
            let entity = records
                .find_entity(name_or_id)?
                .ok_or_else(|| MemoryError::not_found(RecordKind::Entity, name_or_id))?;
            if !records.fact_exists(fact_id)? {
                return Err(MemoryError::not_found(RecordKind::Fact, fact_id.as_str()));
            }

            let created = records.insert_link(&EntityFactLink {
                entity_id: entity.id.clone(),
                fact_id: fact_id.clone(),
                created_at: now,
            })?;
            if created {
                debug!("Linked fact {} to entity {}", fact_id, entity.id);
            }
            Ok(created)
        })
    }

    /// Every fact linked to the entity, in link order, whatever its status.
    pub fn facts_for_entity(&self, name_or_id: &str) -> Result<Vec<Fact>> {
        let db = self.lock()?;
        let records = db.records();
        let entity = records
            .find_entity(name_or_id)?
            .ok_or_else(|| MemoryError::not_found(RecordKind::Entity, name_or_id))?;

        let ids = records.linked_fact_ids(&entity.id)?;
        let keys: Vec<String> = ids.iter().map(|id| id.0.clone()).collect();
        let mut facts = records.facts_by_ids(&keys)?;
        facts.sort_by_key(|fact| ids.iter().position(|id| id == &fact.id));
        Ok(facts)
    }

    // ========== STATS & EXPORT ==========

    pub fn stats(&self) -> Result<MemoryStats> {
        let now = self.now();
        let db = self.lock()?;
        let records = db.records();

        let active_facts = records.count_facts_by_status(FactStatus::Active)?;
        let superseded_facts = records.count_facts_by_status(FactStatus::Superseded)?;
        let deleted_facts = records.count_facts_by_status(FactStatus::Deleted)?;

        Ok(MemoryStats {
            active_facts,
            superseded_facts,
            deleted_facts,
            expired_facts: records.count_expired_facts(now)?,
            total_facts: active_facts + superseded_facts + deleted_facts,
            lessons: records.count_lessons(false)?,
            applied_lessons: records.count_lessons(true)?,
            entities: records.count_entities()?,
            links: records.count_links()?,
        })
    }

    pub fn export(&self) -> Result<MemorySnapshot> {
        let now = self.now();
        self.lock()?.read(|conn| export::export(conn, now))
    }

    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export()?)?)
    }

    pub fn import(&self, snapshot: MemorySnapshot) -> Result<ImportReport> {
        let now = self.now();
        self.lock()?.write(|tx| export::import(tx, snapshot, now))
    }

    pub fn import_json(&self, json: &str) -> Result<ImportReport> {
        let snapshot: MemorySnapshot = serde_json::from_str(json)?;
        self.import(snapshot)
    }
}
