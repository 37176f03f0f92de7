use agent_memory_schemas::RecordKind;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::HashMap;
use tracing::debug;

use crate::tokenizer::tokenize;

/// Inverted token index stored next to the records it covers.
///
/// Borrows a connection rather than owning one so that index writes ride on
/// the caller's transaction and commit or roll back with the record write.
pub struct SearchIndex<'c> {
    conn: &'c Connection,
}

impl<'c> SearchIndex<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Create the token table and its secondary index
    pub fn init_schema(&self) -> rusqlite::Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS search_tokens (
                token TEXT NOT NULL,
                kind TEXT NOT NULL,
                record_id TEXT NOT NULL,
                PRIMARY KEY (kind, token, record_id)
            ) WITHOUT ROWID",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_search_tokens_record
             ON search_tokens(kind, record_id)",
            [],
        )?;

        Ok(())
    }

    /// Replace whatever is indexed for a record with the tokens of `text`.
    /// Returns the number of distinct tokens written.
    pub fn index_record(&self, kind: RecordKind, record_id: &str, text: &str) -> rusqlite::Result<usize> {
        self.remove_record(kind, record_id)?;

        let tokens = tokenize(text);
        let mut stmt = self.conn.prepare_cached(
            "INSERT OR IGNORE INTO search_tokens (token, kind, record_id) VALUES (?1, ?2, ?3)",
        )?;
        for token in &tokens {
            stmt.execute(params![token, kind.as_str(), record_id])?;
        }

        debug!("Indexed {} {} with {} tokens", kind, record_id, tokens.len());
        Ok(tokens.len())
    }

    pub fn remove_record(&self, kind: RecordKind, record_id: &str) -> rusqlite::Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM search_tokens WHERE kind = ?1 AND record_id = ?2",
            params![kind.as_str(), record_id],
        )?;
        if removed > 0 {
            debug!("Removed {} index rows for {} {}", removed, kind, record_id);
        }
        Ok(removed)
    }

    /// OR-match: every record holding at least one of `tokens`, mapped to how
    /// many of the (already distinct) tokens it holds.
    pub fn lookup(&self, kind: RecordKind, tokens: &[String]) -> rusqlite::Result<HashMap<String, usize>> {
        if tokens.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = (0..tokens.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT record_id, COUNT(*) FROM search_tokens
             WHERE kind = ?1 AND token IN ({})
             GROUP BY record_id",
            placeholders
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let bound = std::iter::once(kind.as_str().to_string()).chain(tokens.iter().cloned());
        let hits = stmt
            .query_map(params_from_iter(bound), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;

        debug!("Index lookup over {} tokens hit {} {} records", tokens.len(), hits.len(), kind);
        Ok(hits)
    }

    /// Tokens currently indexed for one record
    pub fn tokens_for(&self, kind: RecordKind, record_id: &str) -> rusqlite::Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT token FROM search_tokens WHERE kind = ?1 AND record_id = ?2 ORDER BY token",
        )?;
        let tokens = stmt
            .query_map(params![kind.as_str(), record_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(tokens)
    }

    pub fn clear(&self) -> rusqlite::Result<usize> {
        self.conn.execute("DELETE FROM search_tokens", [])
    }

    /// Number of distinct records of a kind present in the index
    pub fn indexed_records(&self, kind: RecordKind) -> rusqlite::Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(DISTINCT record_id) FROM search_tokens WHERE kind = ?1",
            params![kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        SearchIndex::new(&conn).init_schema().unwrap();
        conn
    }

    #[test]
    fn test_index_and_lookup_union() {
        let conn = open();
        let index = SearchIndex::new(&conn);

        index
            .index_record(RecordKind::Fact, "fact_a", "API rate limit is 100 req/min")
            .unwrap();
        index
            .index_record(RecordKind::Fact, "fact_b", "Rate of deploys per week")
            .unwrap();
        index
            .index_record(RecordKind::Lesson, "lesson_a", "Rate limit retries with backoff")
            .unwrap();

        let hits = index
            .lookup(RecordKind::Fact, &tokenize("rate limit"))
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits["fact_a"], 2);
        assert_eq!(hits["fact_b"], 1);
        assert!(!hits.contains_key("lesson_a"));
    }

    #[test]
    fn test_reindex_replaces_tokens() {
        let conn = open();
        let index = SearchIndex::new(&conn);

        index.index_record(RecordKind::Entity, "ent_1", "Alice").unwrap();
        index.index_record(RecordKind::Entity, "ent_1", "Alice Cooper").unwrap();
        assert_eq!(
            index.tokens_for(RecordKind::Entity, "ent_1").unwrap(),
            vec!["alice", "cooper"]
        );

        assert_eq!(index.remove_record(RecordKind::Entity, "ent_1").unwrap(), 2);
        assert!(index
            .lookup(RecordKind::Entity, &tokenize("alice"))
            .unwrap()
            .is_empty());
        assert_eq!(index.indexed_records(RecordKind::Entity).unwrap(), 0);
    }

    #[test]
    fn test_index_rolls_back_with_transaction() {
        let mut conn = open();
        {
            let tx = conn.transaction().unwrap();
            SearchIndex::new(&tx)
                .index_record(RecordKind::Fact, "fact_x", "uncommitted words")
                .unwrap();
            tx.rollback().unwrap();
        }
        assert_eq!(
            SearchIndex::new(&conn)
                .indexed_records(RecordKind::Fact)
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_empty_query_has_no_hits() {
        let conn = open();
        let index = SearchIndex::new(&conn);
        index.index_record(RecordKind::Fact, "fact_a", "anything").unwrap();
        assert!(index.lookup(RecordKind::Fact, &[]).unwrap().is_empty());
    }
}
