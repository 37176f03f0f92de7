use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Tunable constants of the relevance formula
/// `overlap_ratio * confidence * recency`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankingConfig {
    /// Age at which the decaying part of the recency weight halves.
    pub half_life_days: f64,
    /// Asymptotic lower bound of the recency weight; keeps old facts findable.
    pub recency_floor: f64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            half_life_days: 30.0,
            recency_floor: 0.1,
        }
    }
}

impl RankingConfig {
    /// Strictly decreasing in age, equal to 1.0 at age zero, never below the floor.
    pub fn recency_weight(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let age_days = ((now - created_at).num_seconds() as f64 / 86_400.0).max(0.0);
        let floor = self.recency_floor.clamp(0.0, 1.0);
        let half_life = if self.half_life_days > 0.0 {
            self.half_life_days
        } else {
            RankingConfig::default().half_life_days
        };

        let decay = (-age_days * std::f64::consts::LN_2 / half_life).exp();
        floor + (1.0 - floor) * decay
    }

    pub fn score(
        &self,
        matched_tokens: usize,
        query_tokens: usize,
        confidence: f64,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> f64 {
        overlap_ratio(matched_tokens, query_tokens)
            * confidence
            * self.recency_weight(created_at, now)
    }
}

/// Fraction of query tokens present in a record.
pub fn overlap_ratio(matched_tokens: usize, query_tokens: usize) -> f64 {
    if query_tokens == 0 {
        return 0.0;
    }
    (matched_tokens.min(query_tokens)) as f64 / query_tokens as f64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scored<T> {
    pub record: T,
    pub score: f64,
}

/// Sort by score descending, falling back to `tie_break` for equal scores,
/// then keep the first `limit` entries.
pub fn rank<T, F>(mut scored: Vec<Scored<T>>, limit: usize, tie_break: F) -> Vec<Scored<T>>
where
    F: Fn(&T, &T) -> Ordering,
{
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| tie_break(&a.record, &b.record))
    });
    scored.truncate(limit);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_recency_weight_decays_to_floor() {
        let config = RankingConfig::default();
        let now = Utc::now();

        let fresh = config.recency_weight(now, now);
        let month = config.recency_weight(now - Duration::days(30), now);
        let year = config.recency_weight(now - Duration::days(365), now);
        let ancient = config.recency_weight(now - Duration::days(36_500), now);

        assert!((fresh - 1.0).abs() < 1e-9);
        assert!((month - 0.55).abs() < 1e-6);
        assert!(fresh > month && month > year && year > ancient);
        assert!(ancient >= config.recency_floor);
        assert!(ancient > 0.0);
    }

    #[test]
    fn test_future_timestamps_clamp_to_fresh() {
        let config = RankingConfig::default();
        let now = Utc::now();
        let weight = config.recency_weight(now + Duration::days(2), now);
        assert!((weight - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_score_combines_factors() {
        let config = RankingConfig::default();
        let now = Utc::now();

        let full = config.score(2, 2, 1.0, now, now);
        let half = config.score(1, 2, 1.0, now, now);
        let unsure = config.score(2, 2, 0.5, now, now);

        assert!((full - 1.0).abs() < 1e-9);
        assert!((half - 0.5).abs() < 1e-9);
        assert!((unsure - 0.5).abs() < 1e-9);
        assert_eq!(config.score(0, 0, 1.0, now, now), 0.0);
    }

    #[test]
    fn test_rank_orders_and_truncates() {
        let scored = vec![
            Scored { record: ("low", 9), score: 0.2 },
            Scored { record: ("tie-few", 1), score: 0.8 },
            Scored { record: ("tie-many", 5), score: 0.8 },
            Scored { record: ("top", 0), score: 0.9 },
        ];

        let ranked = rank(scored, 3, |a, b| b.1.cmp(&a.1));
        let names: Vec<_> = ranked.iter().map(|s| s.record.0).collect();
        assert_eq!(names, vec!["top", "tie-many", "tie-few"]);
    }
}
