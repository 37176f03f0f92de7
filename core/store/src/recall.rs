use agent_memory_indexing::{rank, tokenize, RankingConfig, Scored, SearchIndex};
use agent_memory_schemas::{
    normalize_tags, Entity, Fact, Lesson, Outcome, RecordKind, ValidationError,
};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::collections::HashSet;
use tracing::debug;

use crate::database::Records;
use crate::error::{MemoryError, Result};

pub const DEFAULT_LIMIT: usize = 10;

pub type ScoredFact = Scored<Fact>;
pub type ScoredLesson = Scored<Lesson>;
pub type ScoredEntity = Scored<Entity>;

#[derive(Debug, Clone, PartialEq)]
pub struct RecallQuery {
    pub query: String,
    pub limit: usize,
    /// Keep only facts carrying at least one of these tags.
    pub tags: Vec<String>,
    /// Drop results scoring below this.
    pub min_confidence: Option<f64>,
    /// Entity id or name; keep only facts linked to it.
    pub entity: Option<String>,
}

impl RecallQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            limit: DEFAULT_LIMIT,
            tags: Vec::new(),
            min_confidence: None,
            entity: None,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = Some(min_confidence);
        self
    }

    pub fn entity(mut self, name_or_id: impl Into<String>) -> Self {
        self.entity = Some(name_or_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LessonFilter {
    pub context: Option<String>,
    pub outcome: Option<Outcome>,
    pub limit: usize,
}

impl Default for LessonFilter {
    fn default() -> Self {
        Self {
            context: None,
            outcome: None,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl LessonFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// Text a lesson is searchable by.
pub fn lesson_search_text(lesson: &Lesson) -> String {
    format!("{} {}", lesson.action, lesson.insight)
}

/// Rank live facts against `query` and record the access on every fact
/// returned. Must run inside a write transaction.
pub fn recall(
    conn: &Connection,
    query: &RecallQuery,
    ranking: &RankingConfig,
    now: DateTime<Utc>,
) -> Result<Vec<ScoredFact>> {
    if let Some(min) = query.min_confidence {
        if min.is_nan() || !(0.0..=1.0).contains(&min) {
            return Err(ValidationError::ConfidenceOutOfRange(min).into());
        }
    }
    let wanted_tags = normalize_tags(&query.tags)?;

    let records = Records::new(conn);
    let scope = match &query.entity {
        Some(reference) => {
            let entity = records
                .find_entity(reference)?
                .ok_or_else(|| MemoryError::not_found(RecordKind::Entity, reference.as_str()))?;
            Some(records.linked_fact_ids(&entity.id)?.into_iter().collect::<HashSet<_>>())
        }
        None => None,
    };

    let tokens = tokenize(&query.query);
    if tokens.is_empty() || query.limit == 0 {
        return Ok(Vec::new());
    }

    let hits = SearchIndex::new(conn).lookup(RecordKind::Fact, &tokens)?;
    let ids: Vec<String> = hits.keys().cloned().collect();

    let mut scored = Vec::new();
    for fact in records.facts_by_ids(&ids)? {
        if !fact.is_live(now) {
            continue;
        }
        if !wanted_tags.is_empty() && !fact.has_any_tag(&wanted_tags) {
            continue;
        }
        if let Some(linked) = &scope {
            if !linked.contains(&fact.id) {
                continue;
            }
        }

        let matched = hits.get(fact.id.as_str()).copied().unwrap_or(0);
        let score = ranking.score(matched, tokens.len(), fact.confidence, fact.created_at, now);
        if query.min_confidence.map_or(false, |min| score < min) {
            continue;
        }
        scored.push(Scored { record: fact, score });
    }

    let mut ranked = rank(scored, query.limit, |a: &Fact, b: &Fact| {
        b.access_count
            .cmp(&a.access_count)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });

    for hit in &mut ranked {
        records.record_fact_access(&hit.record.id, now)?;
        hit.record.access_count += 1;
        hit.record.last_accessed_at = Some(now);
    }

    debug!("Recall '{}' returned {} facts", query.query, ranked.len());
    Ok(ranked)
}

pub fn get_lessons(conn: &Connection, filter: &LessonFilter) -> Result<Vec<Lesson>> {
    let context = filter.context.as_deref().map(str::trim);
    Records::new(conn).list_lessons(context, filter.outcome, filter.limit)
}

pub fn search_lessons(
    conn: &Connection,
    query: &str,
    limit: usize,
    ranking: &RankingConfig,
    now: DateTime<Utc>,
) -> Result<Vec<ScoredLesson>> {
    let tokens = tokenize(query);
    if tokens.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }

    let hits = SearchIndex::new(conn).lookup(RecordKind::Lesson, &tokens)?;
    let ids: Vec<String> = hits.keys().cloned().collect();

    let scored = Records::new(conn)
        .lessons_by_ids(&ids)?
        .into_iter()
        .map(|lesson| {
            let matched = hits.get(lesson.id.as_str()).copied().unwrap_or(0);
            let score = ranking.score(matched, tokens.len(), 1.0, lesson.created_at, now);
            Scored { record: lesson, score }
        })
        .collect();

    Ok(rank(scored, limit, |a: &Lesson, b: &Lesson| {
        b.applied_count
            .cmp(&a.applied_count)
            .then_with(|| b.created_at.cmp(&a.created_at))
    }))
}

pub fn find_entities(
    conn: &Connection,
    query: &str,
    limit: usize,
    ranking: &RankingConfig,
    now: DateTime<Utc>,
) -> Result<Vec<ScoredEntity>> {
    let tokens = tokenize(query);
    if tokens.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }

    let hits = SearchIndex::new(conn).lookup(RecordKind::Entity, &tokens)?;
    let ids: Vec<String> = hits.keys().cloned().collect();

    let scored = Records::new(conn)
        .entities_by_ids(&ids)?
        .into_iter()
        .map(|entity| {
            let matched = hits.get(entity.id.as_str()).copied().unwrap_or(0);
            let score = ranking.score(matched, tokens.len(), 1.0, entity.updated_at, now);
            Scored { record: entity, score }
        })
        .collect();

    Ok(rank(scored, limit, |a: &Entity, b: &Entity| {
        b.updated_at.cmp(&a.updated_at)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreLocation;
    use crate::database::Database;
    use crate::retention::insert_fact;
    use agent_memory_schemas::NewFact;
    use chrono::Duration;

    fn remember(db: &mut Database, draft: NewFact, created_at: DateTime<Utc>) -> Fact {
        let fact = Fact::new(draft, created_at).unwrap();
        db.write(|tx| insert_fact(tx, &fact)).unwrap();
        fact
    }

    #[test]
    fn test_recall_prefers_full_overlap() {
        let mut db = Database::open(&StoreLocation::InMemory).unwrap();
        let now = Utc::now();
        let partial = remember(&mut db, NewFact::new("Rate of deploys is weekly"), now);
        let full = remember(&mut db, NewFact::new("API rate limit is 100 req/min"), now);

        let results = db
            .write(|tx| recall(tx, &RecallQuery::new("rate limit"), &RankingConfig::default(), now))
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].record.id, full.id);
        assert_eq!(results[1].record.id, partial.id);
        assert!(results[0].score > results[1].score);
        assert_eq!(results[0].record.access_count, 1);
    }

    #[test]
    fn test_recall_filters_expired_and_tags() {
        let mut db = Database::open(&StoreLocation::InMemory).unwrap();
        let now = Utc::now();
        remember(
            &mut db,
            NewFact::new("Temporary server password rotates").expires_in_days(1),
            now - Duration::days(2),
        );
        let tagged = remember(
            &mut db,
            NewFact::new("Server runs on port 8080").tags(["infra"]),
            now,
        );
        remember(&mut db, NewFact::new("Server room is cold"), now);

        let results = db
            .write(|tx| {
                recall(
                    tx,
                    &RecallQuery::new("server").tags(["infra"]),
                    &RankingConfig::default(),
                    now,
                )
            })
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record.id, tagged.id);
    }

    #[test]
    fn test_recall_min_confidence_cuts_low_scores() {
        let mut db = Database::open(&StoreLocation::InMemory).unwrap();
        let now = Utc::now();
        remember(&mut db, NewFact::new("Maybe the cache is flaky").confidence(0.3), now);
        let sure = remember(&mut db, NewFact::new("The cache is redis").confidence(0.9), now);

        let results = db
            .write(|tx| {
                recall(
                    tx,
                    &RecallQuery::new("cache").min_confidence(0.5),
                    &RankingConfig::default(),
                    now,
                )
            })
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record.id, sure.id);

        let invalid = db.write(|tx| {
            recall(tx, &RecallQuery::new("cache").min_confidence(1.5), &RankingConfig::default(), now)
        });
        assert!(invalid.unwrap_err().is_validation());
    }

    #[test]
    fn test_recall_ties_break_on_access_count() {
        let mut db = Database::open(&StoreLocation::InMemory).unwrap();
        let now = Utc::now();
        let quiet = remember(&mut db, NewFact::new("Build uses cargo"), now);
        let busy = remember(&mut db, NewFact::new("Build uses make"), now);
        db.write(|tx| {
            let records = Records::new(tx);
            records.record_fact_access(&busy.id, now)?;
            records.record_fact_access(&busy.id, now)
        })
        .unwrap();

        let results = db
            .write(|tx| recall(tx, &RecallQuery::new("build"), &RankingConfig::default(), now))
            .unwrap();

        assert_eq!(results[0].record.id, busy.id);
        assert_eq!(results[0].record.access_count, 3);
        assert_eq!(results[1].record.id, quiet.id);
    }

    #[test]
    fn test_empty_query_returns_nothing() {
        let mut db = Database::open(&StoreLocation::InMemory).unwrap();
        let now = Utc::now();
        remember(&mut db, NewFact::new("The and of"), now);

        let results = db
            .write(|tx| recall(tx, &RecallQuery::new("  the, of! "), &RankingConfig::default(), now))
            .unwrap();
        assert!(results.is_empty());
    }
}
