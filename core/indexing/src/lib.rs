pub mod ranking;
pub mod search;
pub mod tokenizer;

pub use ranking::{overlap_ratio, rank, RankingConfig, Scored};
pub use search::SearchIndex;
pub use tokenizer::tokenize;
