use agent_memory_indexing::SearchIndex;
use agent_memory_schemas::{
    EntityFactLink, Fact, FactId, FactStatus, FactUpdate, NewFact, RecordKind,
};
use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::database::Records;
use crate::error::{MemoryError, Result};

/// Fill in the store-wide expiry when the caller gave none.
pub fn with_default_expiry(mut draft: NewFact, default_expiry_days: Option<u32>) -> NewFact {
    if draft.expires_in_days.is_none() {
        draft.expires_in_days = default_expiry_days;
    }
    draft
}

/// `now - days`, saturating at the earliest representable instant.
fn days_before(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    TimeDelta::try_days(i64::from(days))
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Persist a new fact and its index rows.
pub fn insert_fact(conn: &Connection, fact: &Fact) -> Result<()> {
    Records::new(conn).insert_fact(fact)?;
    SearchIndex::new(conn).index_record(RecordKind::Fact, fact.id.as_str(), &fact.content)?;
    Ok(())
}

/// Replace an active fact with a corrected one. The old record stays
/// readable by id; only the new one is searchable.
pub fn supersede(
    conn: &Connection,
    old_id: &FactId,
    update: FactUpdate,
    default_expiry_days: Option<u32>,
    now: DateTime<Utc>,
) -> Result<Fact> {
    let records = Records::new(conn);
    let old = records
        .get_fact(old_id)?
        .ok_or_else(|| MemoryError::not_found(RecordKind::Fact, old_id.as_str()))?;

    if !old.is_active() {
        return Err(MemoryError::invalid(format!(
            "fact {} is {} and cannot be superseded",
            old.id,
            old.status.as_str()
        )));
    }

    let draft = with_default_expiry(update.into_new_fact(&old), default_expiry_days);
    let replacement = Fact::new(draft, now)?;

    insert_fact(conn, &replacement)?;
    records.set_fact_status(&old.id, FactStatus::Superseded, Some(&replacement.id))?;
    SearchIndex::new(conn).remove_record(RecordKind::Fact, old.id.as_str())?;

    for entity_id in records.linked_entity_ids(&old.id)? {
        records.insert_link(&EntityFactLink {
            entity_id,
            fact_id: replacement.id.clone(),
            created_at: now,
        })?;
    }

    info!("Superseded fact {} with {}", old.id, replacement.id);
    Ok(replacement)
}

/// Mark a fact deleted. Forgetting an already-deleted fact changes nothing.
pub fn forget(conn: &Connection, id: &FactId) -> Result<Fact> {
    let records = Records::new(conn);
    let mut fact = records
        .get_fact(id)?
        .ok_or_else(|| MemoryError::not_found(RecordKind::Fact, id.as_str()))?;

    if fact.status == FactStatus::Deleted {
        debug!("Fact {} already deleted", id);
        return Ok(fact);
    }

    mark_deleted(conn, &fact.id)?;
    fact.status = FactStatus::Deleted;
    fact.superseded_by = None;

    info!("Forgot fact {}", id);
    Ok(fact)
}

fn mark_deleted(conn: &Connection, id: &FactId) -> Result<()> {
    Records::new(conn).set_fact_status(id, FactStatus::Deleted, None)?;
    SearchIndex::new(conn).remove_record(RecordKind::Fact, id.as_str())?;
    Ok(())
}

/// Delete every active fact whose expiry has passed.
pub fn sweep_expired(conn: &Connection, now: DateTime<Utc>) -> Result<usize> {
    let expired = Records::new(conn).expired_fact_ids(now)?;
    for id in &expired {
        mark_deleted(conn, id)?;
    }
    if !expired.is_empty() {
        warn!("Swept {} expired facts", expired.len());
    }
    Ok(expired.len())
}

/// Delete active facts nobody has looked at for `days` and that were read at
/// most `min_access_count` times. Expired facts are swept first and are not
/// part of the returned count.
pub fn forget_stale(
    conn: &Connection,
    days: u32,
    min_access_count: u64,
    now: DateTime<Utc>,
) -> Result<usize> {
    sweep_expired(conn, now)?;

    let cutoff = days_before(now, days);
    let stale = Records::new(conn).stale_fact_ids(cutoff, min_access_count)?;
    for id in &stale {
        mark_deleted(conn, id)?;
    }

    info!(
        "Forgot {} stale facts (untouched for {} days, <= {} accesses)",
        stale.len(),
        days,
        min_access_count
    );
    Ok(stale.len())
}

/// Physically remove superseded and deleted facts created before the horizon.
///
/// A purged fact may still be the successor of an older superseded fact that
/// is kept; such pointers are cleared and the older fact becomes deleted so
/// every chain still ends on a stored record.
pub fn purge(conn: &Connection, older_than_days: u32, now: DateTime<Utc>) -> Result<usize> {
    let records = Records::new(conn);
    let index = SearchIndex::new(conn);
    let cutoff = days_before(now, older_than_days);
    let doomed = records.purgeable_fact_ids(cutoff)?;

    for id in &doomed {
        for predecessor in records.predecessors_of(id)? {
            if !doomed.contains(&predecessor) {
                records.set_fact_status(&predecessor, FactStatus::Deleted, None)?;
            }
        }
    }

    // Pointers between doomed rows would otherwise trip the deferred
    // foreign key at commit.
    for id in &doomed {
        records.set_fact_status(id, FactStatus::Deleted, None)?;
        index.remove_record(RecordKind::Fact, id.as_str())?;
    }

    let removed = records.delete_facts(&doomed)?;
    info!("Purged {} inactive facts older than {} days", removed, older_than_days);
    Ok(removed)
}
