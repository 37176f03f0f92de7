pub mod config;
pub mod database;
pub mod error;
pub mod export;
pub mod recall;
pub mod retention;
pub mod store;

pub use config::{StoreConfig, StoreLocation};
pub use database::{Database, SCHEMA_VERSION};
pub use error::{MemoryError, Result};
pub use recall::{LessonFilter, RecallQuery, ScoredEntity, ScoredFact, ScoredLesson};
pub use store::{system_clock, Clock, MemoryStore};

pub use agent_memory_indexing::{RankingConfig, Scored};
pub use agent_memory_schemas::*;
