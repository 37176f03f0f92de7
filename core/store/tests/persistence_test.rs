use agent_memory_store::{
    attributes, FactStatus, FactUpdate, MemoryStore, NewFact, NewLesson, Outcome, RecallQuery,
    StoreConfig, StoreLocation,
};
use anyhow::Result;
use std::io::Write;
use tempfile::{NamedTempFile, TempDir};

#[test]
fn test_reopen_sees_committed_records() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("nested").join("memory.db");

    let (fact_id, replacement_id) = {
        let store = MemoryStore::open(StoreConfig::file(&path))?;
        let fact = store.remember(NewFact::new("Backups run nightly at 2am").tags(["ops"]))?;
        let replacement = store.supersede(&fact.id, FactUpdate::new("Backups run nightly at 3am"))?;
        store.learn(NewLesson::new(
            "Restored from backup",
            "operations",
            Outcome::Positive,
            "Test restores monthly",
        ))?;
        store.track_entity("Backup Service", "system", attributes([("owner", "ops")]))?;
        store.link_fact_to_entity("Backup Service", &replacement.id)?;
        store.recall(&RecallQuery::new("backups nightly"))?;
        store.close()?;
        (fact.id, replacement.id)
    };

    assert!(path.exists());

    let store = MemoryStore::open(StoreConfig::file(&path))?;
    let stats = store.stats()?;
    assert_eq!(stats.active_facts, 1);
    assert_eq!(stats.superseded_facts, 1);
    assert_eq!(stats.lessons, 1);
    assert_eq!(stats.entities, 1);
    assert_eq!(stats.links, 1);

    let old = store.get_fact(&fact_id)?;
    assert_eq!(old.status, FactStatus::Superseded);
    assert_eq!(old.superseded_by, Some(replacement_id.clone()));

    let current = store.get_fact(&replacement_id)?;
    assert_eq!(current.access_count, 1);
    assert_eq!(current.tags, vec!["ops".to_string()]);

    let hits = store.recall(&RecallQuery::new("backups"))?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].record.id, replacement_id);
    assert_eq!(hits[0].record.access_count, 2);
    Ok(())
}

#[test]
fn test_failed_mutation_leaves_file_unchanged() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("memory.db");

    {
        let store = MemoryStore::open(StoreConfig::file(&path))?;
        store.remember(NewFact::new("Only fact"))?;
        assert!(store.remember(NewFact::new("   ")).is_err());
        assert!(store.remember(NewFact::new("Bad").tags(["ok", " "])).is_err());
    }

    let store = MemoryStore::open(StoreConfig::file(&path))?;
    assert_eq!(store.stats()?.total_facts, 1);
    Ok(())
}

#[test]
fn test_non_sqlite_file_is_rejected() -> Result<()> {
    let mut file = NamedTempFile::new()?;
    file.write_all(b"# agent notes\nthis file is markdown, not a database\n")?;
    file.write_all(&[b'-'; 4096])?;
    file.flush()?;

    let result = MemoryStore::open(StoreConfig::file(file.path()));
    let err = match result {
        Ok(_) => panic!("opening a text file must fail"),
        Err(err) => err,
    };
    assert!(err.is_storage());
    Ok(())
}

#[test]
fn test_in_memory_store_starts_empty_each_time() -> Result<()> {
    let store = MemoryStore::open(StoreConfig::in_memory())?;
    store.remember(NewFact::new("Ephemeral"))?;
    store.close()?;

    let store = MemoryStore::open(StoreConfig {
        location: StoreLocation::InMemory,
        ..StoreConfig::in_memory()
    })?;
    assert_eq!(store.stats()?.total_facts, 0);
    Ok(())
}
