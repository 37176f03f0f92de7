use agent_memory_indexing::SearchIndex;
use agent_memory_schemas::{
    check_timestamp, generate_entity_id, normalize_entity_type, normalize_tags, EntityFactLink, EntityId, FactId,
    ImportReport, MemorySnapshot, RecordKind, SNAPSHOT_FORMAT_VERSION,
};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::database::Records;
use crate::error::{MemoryError, Result};
use crate::recall::lesson_search_text;

pub fn export(conn: &Connection, now: DateTime<Utc>) -> Result<MemorySnapshot> {
    let records = Records::new(conn);

    let mut facts = records.list_facts(true)?;
    facts.reverse();
    let mut entities = records.list_entities(None)?;
    entities.reverse();

    let snapshot = MemorySnapshot {
        format_version: SNAPSHOT_FORMAT_VERSION,
        exported_at: now,
        facts,
        lessons: records.all_lessons()?,
        entities,
        links: records.all_links()?,
    };

    info!(
        "Exported {} facts, {} lessons, {} entities, {} links",
        snapshot.facts.len(),
        snapshot.lessons.len(),
        snapshot.entities.len(),
        snapshot.links.len()
    );
    Ok(snapshot)
}

/// Re-derive every index row from the record tables. Only active facts are
/// indexed; every lesson and entity is.
pub fn rebuild_index(conn: &Connection) -> Result<usize> {
    let records = Records::new(conn);
    let index = SearchIndex::new(conn);
    index.clear()?;

    let mut indexed = 0;
    for fact in records.list_facts(false)? {
        index.index_record(RecordKind::Fact, fact.id.as_str(), &fact.content)?;
        indexed += 1;
    }
    for lesson in records.all_lessons()? {
        index.index_record(RecordKind::Lesson, lesson.id.as_str(), &lesson_search_text(&lesson))?;
        indexed += 1;
    }
    for entity in records.list_entities(None)? {
        index.index_record(RecordKind::Entity, entity.id.as_str(), &entity.name)?;
        indexed += 1;
    }

    debug!("Rebuilt search index over {} records", indexed);
    Ok(indexed)
}

/// Load a snapshot into the store. Nothing is written unless every record
/// passes validation; records whose id is already stored are skipped and
/// entities are merged by `(name, entity_type)`.
pub fn import(conn: &Connection, snapshot: MemorySnapshot, now: DateTime<Utc>) -> Result<ImportReport> {
    if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
        return Err(MemoryError::invalid(format!(
            "snapshot format {} is newer than supported format {}",
            snapshot.format_version, SNAPSHOT_FORMAT_VERSION
        )));
    }

    let records = Records::new(conn);
    let MemorySnapshot {
        mut facts,
        mut lessons,
        mut entities,
        links,
        ..
    } = snapshot;

    for fact in &mut facts {
        fact.validate()?;
        fact.content = fact.content.trim().to_string();
        fact.tags = normalize_tags(&fact.tags)?;
    }
    for lesson in &mut lessons {
        lesson.validate()?;
        lesson.action = lesson.action.trim().to_string();
        lesson.context = lesson.context.trim().to_string();
        lesson.insight = lesson.insight.trim().to_string();
    }
    for entity in &mut entities {
        entity.validate()?;
        entity.name = entity.name.trim().to_string();
        entity.entity_type = normalize_entity_type(&entity.entity_type)?;
    }
    for link in &links {
        check_timestamp("link created_at", &link.created_at)?;
    }

    check_unique("fact", facts.iter().map(|f| f.id.as_str()))?;
    check_unique("lesson", lessons.iter().map(|l| l.id.as_str()))?;
    check_unique("entity", entities.iter().map(|e| e.id.as_str()))?;

    let successors: HashMap<&FactId, Option<&FactId>> = facts
        .iter()
        .map(|fact| (&fact.id, fact.superseded_by.as_ref()))
        .collect();
    check_chains(&records, &successors)?;

    let snapshot_entity_ids: HashSet<&str> = entities.iter().map(|e| e.id.as_str()).collect();
    for link in &links {
        if !snapshot_entity_ids.contains(link.entity_id.as_str())
            && records.get_entity(&link.entity_id)?.is_none()
        {
            return Err(MemoryError::invalid(format!(
                "link references unknown entity {}",
                link.entity_id
            )));
        }
        if !successors.contains_key(&link.fact_id) && !records.fact_exists(&link.fact_id)? {
            return Err(MemoryError::invalid(format!(
                "link references unknown fact {}",
                link.fact_id
            )));
        }
    }

    let mut report = ImportReport::default();

    for fact in &facts {
        if records.fact_exists(&fact.id)? {
            report.facts_skipped += 1;
            continue;
        }
        records.insert_fact(fact)?;
        report.facts_imported += 1;
    }

    for lesson in &lessons {
        if records.lesson_exists(&lesson.id)? {
            report.lessons_skipped += 1;
            continue;
        }
        records.insert_lesson(lesson)?;
        report.lessons_imported += 1;
    }

    let mut entity_ids: HashMap<EntityId, EntityId> = HashMap::new();
    for mut entity in entities {
        let incoming_id = entity.id.clone();
        match records.get_entity_by_key(&entity.name, &entity.entity_type)? {
            Some(mut existing) => {
                let updated_at = existing.updated_at.max(entity.updated_at);
                existing.merge_attributes(entity.attributes, updated_at)?;
                records.update_entity(&existing)?;
                entity_ids.insert(incoming_id, existing.id);
                report.entities_merged += 1;
            }
            None => {
                if records.get_entity(&entity.id)?.is_some() {
                    entity.id = generate_entity_id();
                }
                records.insert_entity(&entity)?;
                entity_ids.insert(incoming_id, entity.id);
                report.entities_imported += 1;
            }
        }
    }

    for link in links {
        let entity_id = entity_ids.get(&link.entity_id).cloned().unwrap_or(link.entity_id);
        let inserted = records.insert_link(&EntityFactLink {
            entity_id,
            fact_id: link.fact_id,
            created_at: link.created_at,
        })?;
        if inserted {
            report.links_imported += 1;
        }
    }

    rebuild_index(conn)?;

    info!(
        "Imported snapshot at {}: {} facts ({} skipped), {} lessons ({} skipped), {} entities ({} merged), {} links",
        now,
        report.facts_imported,
        report.facts_skipped,
        report.lessons_imported,
        report.lessons_skipped,
        report.entities_imported,
        report.entities_merged,
        report.links_imported
    );
    Ok(report)
}

fn check_unique<'a>(kind: &str, ids: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(MemoryError::invalid(format!("duplicate {} id {} in snapshot", kind, id)));
        }
    }
    Ok(())
}

/// Every successor must exist and following successors must never loop.
fn check_chains(records: &Records<'_>, successors: &HashMap<&FactId, Option<&FactId>>) -> Result<()> {
    for (start, next) in successors {
        let mut seen: HashSet<&FactId> = HashSet::from([*start]);
        let mut cursor = *next;

        while let Some(id) = cursor {
            if !seen.insert(id) {
                return Err(MemoryError::invalid(format!(
                    "supersession chain starting at {} loops back to {}",
                    start, id
                )));
            }
            cursor = match successors.get(id) {
                Some(following) => *following,
                None => {
                    if !records.fact_exists(id)? {
                        return Err(MemoryError::invalid(format!(
                            "fact {} is superseded by unknown fact {}",
                            start, id
                        )));
                    }
                    None
                }
            };
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreLocation;
    use crate::database::Database;
    use crate::retention::{insert_fact, supersede};
    use agent_memory_schemas::{attributes, Entity, Fact, FactStatus, FactUpdate, NewFact};

    #[test]
    fn test_import_rejects_loops_without_writing() {
        let mut db = Database::open(&StoreLocation::InMemory).unwrap();
        let now = Utc::now();

        let mut a = Fact::new(NewFact::new("A"), now).unwrap();
        let mut b = Fact::new(NewFact::new("B"), now).unwrap();
        a.status = FactStatus::Superseded;
        a.superseded_by = Some(b.id.clone());
        b.status = FactStatus::Superseded;
        b.superseded_by = Some(a.id.clone());
        let fine = Fact::new(NewFact::new("Fine"), now).unwrap();

        let snapshot = MemorySnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            exported_at: now,
            facts: vec![fine.clone(), a, b],
            lessons: vec![],
            entities: vec![],
            links: vec![],
        };

        let result = db.write(|tx| import(tx, snapshot, now));
        assert!(result.unwrap_err().is_validation());
        assert!(db.records().get_fact(&fine.id).unwrap().is_none());
    }

    #[test]
    fn test_import_skips_known_and_merges_entities() {
        let mut source = Database::open(&StoreLocation::InMemory).unwrap();
        let now = Utc::now();
        let fact = Fact::new(NewFact::new("Alice owns billing"), now).unwrap();
        let entity = Entity::new("Alice", "Person", attributes([("team", "billing")]), now).unwrap();
        source
            .write(|tx| {
                insert_fact(tx, &fact)?;
                let records = Records::new(tx);
                records.insert_entity(&entity)?;
                records.insert_link(&EntityFactLink {
                    entity_id: entity.id.clone(),
                    fact_id: fact.id.clone(),
                    created_at: now,
                })?;
                supersede(tx, &fact.id, FactUpdate::new("Alice owns payments"), None, now)?;
                Ok(())
            })
            .unwrap();
        let snapshot = source.read(|conn| export(conn, now)).unwrap();

        let mut target = Database::open(&StoreLocation::InMemory).unwrap();
        let local = Entity::new("Alice", "person", attributes([("level", 3i64)]), now).unwrap();
        target
            .write(|tx| Records::new(tx).insert_entity(&local))
            .unwrap();

        let report = target.write(|tx| import(tx, snapshot.clone(), now)).unwrap();
        assert_eq!(report.facts_imported, 2);
        assert_eq!(report.entities_merged, 1);
        assert_eq!(report.entities_imported, 0);
        assert_eq!(report.links_imported, 2);

        let merged = target.records().get_entity(&local.id).unwrap().unwrap();
        assert_eq!(merged.attributes.len(), 2);
        assert_eq!(target.records().linked_fact_ids(&local.id).unwrap().len(), 2);

        let again = target.write(|tx| import(tx, snapshot, now)).unwrap();
        assert_eq!(again.facts_imported, 0);
        assert_eq!(again.facts_skipped, 2);
        assert_eq!(again.links_imported, 0);

        let hits = target
            .read(|conn| Ok(SearchIndex::new(conn).lookup(RecordKind::Fact, &["alice".to_string()])?))
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_import_trims_text_before_matching() {
        let now = Utc::now();
        let mut padded = Entity::new("Alice", "person", attributes([("team", "billing")]), now).unwrap();
        padded.name = "  Alice ".to_string();
        let mut fact = Fact::new(NewFact::new("Alice owns billing"), now).unwrap();
        fact.content = "\tAlice owns billing  ".to_string();

        let snapshot = MemorySnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            exported_at: now,
            facts: vec![fact.clone()],
            lessons: vec![],
            entities: vec![padded],
            links: vec![],
        };

        let mut target = Database::open(&StoreLocation::InMemory).unwrap();
        let local = Entity::new("Alice", "person", attributes([("level", 3i64)]), now).unwrap();
        target
            .write(|tx| Records::new(tx).insert_entity(&local))
            .unwrap();

        let report = target.write(|tx| import(tx, snapshot, now)).unwrap();
        assert_eq!(report.entities_merged, 1);
        assert_eq!(report.entities_imported, 0);

        let stored = target.records().get_fact(&fact.id).unwrap().unwrap();
        assert_eq!(stored.content, "Alice owns billing");
        assert_eq!(target.records().list_entities(None).unwrap().len(), 1);
    }
}
