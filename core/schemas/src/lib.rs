use chrono::{DateTime, Datelike, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// ULID and ID Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LessonId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl FactId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl LessonId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl EntityId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FactId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LessonId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The three searchable record families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Fact,
    Lesson,
    Entity,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Fact => "fact",
            RecordKind::Lesson => "lesson",
            RecordKind::Entity => "entity",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Validation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("confidence must be within [0, 1], got {0}")]
    ConfidenceOutOfRange(f64),

    #[error("{field} must not be empty")]
    EmptyField { field: &'static str },

    #[error("unknown {kind} '{value}'")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("{0}")]
    Invalid(String),
}

fn require_text(field: &'static str, value: &str) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyField { field });
    }
    Ok(trimmed.to_string())
}

/// Upper bound for `expires_in_days`, roughly a century.
pub const MAX_EXPIRY_DAYS: u32 = 36_500;

/// Timestamps must stay within four-digit years to keep their stored text
/// fixed-width and parseable.
pub fn check_timestamp(field: &'static str, at: &DateTime<Utc>) -> Result<(), ValidationError> {
    if !(0..=9999).contains(&at.year()) {
        return Err(ValidationError::Invalid(format!(
            "{} {} is outside years 0000-9999",
            field, at
        )));
    }
    Ok(())
}

/// `now` plus `days`, rejecting spans longer than `MAX_EXPIRY_DAYS`.
pub fn expiry_from(now: DateTime<Utc>, days: u32) -> Result<DateTime<Utc>, ValidationError> {
    if days == 0 || days > MAX_EXPIRY_DAYS {
        return Err(ValidationError::Invalid(format!(
            "expires_in_days must be within 1..={}, got {}",
            MAX_EXPIRY_DAYS, days
        )));
    }
    let expires_at = TimeDelta::try_days(i64::from(days))
        .and_then(|span| now.checked_add_signed(span))
        .ok_or_else(|| {
            ValidationError::Invalid(format!("expiry {} days after {} is out of range", days, now))
        })?;
    check_timestamp("expires_at", &expires_at)?;
    Ok(expires_at)
}

fn check_confidence(confidence: f64) -> Result<f64, ValidationError> {
    if confidence.is_nan() || !(0.0..=1.0).contains(&confidence) {
        return Err(ValidationError::ConfidenceOutOfRange(confidence));
    }
    Ok(confidence)
}

/// Trim, reject blanks, sort and de-duplicate.
pub fn normalize_tags<I, S>(tags: I) -> Result<Vec<String>, ValidationError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut normalized = Vec::new();
    for tag in tags {
        normalized.push(require_text("tag", tag.as_ref())?);
    }
    normalized.sort();
    normalized.dedup();
    Ok(normalized)
}

/// Entity types are an open set; compare them case-insensitively.
pub fn normalize_entity_type(raw: &str) -> Result<String, ValidationError> {
    Ok(require_text("entity_type", raw)?.to_lowercase())
}

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FactSource {
    #[default]
    #[serde(rename = "conversation")]
    Conversation,
    #[serde(rename = "observation")]
    Observation,
    #[serde(rename = "inference")]
    Inference,
}

impl FactSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactSource::Conversation => "conversation",
            FactSource::Observation => "observation",
            FactSource::Inference => "inference",
        }
    }
}

impl FromStr for FactSource {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "conversation" => Ok(FactSource::Conversation),
            "observation" => Ok(FactSource::Observation),
            "inference" => Ok(FactSource::Inference),
            _ => Err(ValidationError::UnknownVariant {
                kind: "source",
                value: raw.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FactStatus {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "superseded")]
    Superseded,
    #[serde(rename = "deleted")]
    Deleted,
}

impl FactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactStatus::Active => "active",
            FactStatus::Superseded => "superseded",
            FactStatus::Deleted => "deleted",
        }
    }
}

impl FromStr for FactStatus {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "active" => Ok(FactStatus::Active),
            "superseded" => Ok(FactStatus::Superseded),
            "deleted" => Ok(FactStatus::Deleted),
            _ => Err(ValidationError::UnknownVariant {
                kind: "status",
                value: raw.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    #[serde(rename = "positive")]
    Positive,
    #[serde(rename = "negative")]
    Negative,
    #[serde(rename = "neutral")]
    Neutral,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Positive => "positive",
            Outcome::Negative => "negative",
            Outcome::Neutral => "neutral",
        }
    }
}

impl FromStr for Outcome {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "positive" => Ok(Outcome::Positive),
            "negative" => Ok(Outcome::Negative),
            "neutral" => Ok(Outcome::Neutral),
            _ => Err(ValidationError::UnknownVariant {
                kind: "outcome",
                value: raw.to_string(),
            }),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Fact Schema
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: FactId,
    pub content: String,
    pub tags: Vec<String>,
    pub source: FactSource,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub access_count: u64,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub status: FactStatus,
    pub superseded_by: Option<FactId>,
}

/// Input for `remember`. Built with chained setters.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFact {
    pub content: String,
    pub tags: Vec<String>,
    pub source: FactSource,
    pub confidence: f64,
    pub expires_in_days: Option<u32>,
}

impl NewFact {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tags: Vec::new(),
            source: FactSource::default(),
            confidence: 1.0,
            expires_in_days: None,
        }
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn source(mut self, source: FactSource) -> Self {
        self.source = source;
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn expires_in_days(mut self, days: u32) -> Self {
        self.expires_in_days = Some(days);
        self
    }
}

/// Replacement content for `supersede`. Unset fields carry over from the old fact.
#[derive(Debug, Clone, PartialEq)]
pub struct FactUpdate {
    pub content: String,
    pub tags: Option<Vec<String>>,
    pub source: Option<FactSource>,
    pub confidence: Option<f64>,
    pub expires_in_days: Option<u32>,
}

impl FactUpdate {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tags: None,
            source: None,
            confidence: None,
            expires_in_days: None,
        }
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn source(mut self, source: FactSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn expires_in_days(mut self, days: u32) -> Self {
        self.expires_in_days = Some(days);
        self
    }

    pub fn into_new_fact(self, previous: &Fact) -> NewFact {
        NewFact {
            content: self.content,
            tags: self.tags.unwrap_or_else(|| previous.tags.clone()),
            source: self.source.unwrap_or(previous.source),
            confidence: self.confidence.unwrap_or(previous.confidence),
            expires_in_days: self.expires_in_days,
        }
    }
}

impl Fact {
    pub fn new(draft: NewFact, now: DateTime<Utc>) -> Result<Self, ValidationError> {
        let content = require_text("content", &draft.content)?;
        let confidence = check_confidence(draft.confidence)?;
        let tags = normalize_tags(&draft.tags)?;

        check_timestamp("created_at", &now)?;
        let expires_at = draft
            .expires_in_days
            .map(|days| expiry_from(now, days))
            .transpose()?;

        Ok(Self {
            id: generate_fact_id(),
            content,
            tags,
            source: draft.source,
            confidence,
            created_at: now,
            expires_at,
            access_count: 0,
            last_accessed_at: None,
            status: FactStatus::Active,
            superseded_by: None,
        })
    }

    /// Check a fully formed record, e.g. one read back from a snapshot.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text("content", &self.content)?;
        check_confidence(self.confidence)?;
        for tag in &self.tags {
            require_text("tag", tag)?;
        }
        check_timestamp("created_at", &self.created_at)?;
        if let Some(at) = &self.expires_at {
            check_timestamp("expires_at", at)?;
        }
        if let Some(at) = &self.last_accessed_at {
            check_timestamp("last_accessed_at", at)?;
        }
        match (self.status, &self.superseded_by) {
            (FactStatus::Superseded, None) => Err(ValidationError::Invalid(format!(
                "fact {} is superseded but has no successor",
                self.id
            ))),
            (FactStatus::Active | FactStatus::Deleted, Some(next)) => {
                Err(ValidationError::Invalid(format!(
                    "fact {} is {} but points at successor {}",
                    self.id,
                    self.status.as_str(),
                    next
                )))
            }
            (FactStatus::Superseded, Some(next)) if next == &self.id => Err(
                ValidationError::Invalid(format!("fact {} supersedes itself", self.id)),
            ),
            _ => Ok(()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == FactStatus::Active
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    /// Active and not past its expiry; the only facts recall may return.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && !self.is_expired(now)
    }

    /// Reference point for staleness: last access, or creation if never read.
    pub fn staleness_anchor(&self) -> DateTime<Utc> {
        self.last_accessed_at.unwrap_or(self.created_at)
    }

    pub fn has_any_tag(&self, wanted: &[String]) -> bool {
        wanted.iter().any(|tag| self.tags.contains(tag))
    }
}

// ============================================================================
// Lesson Schema
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: LessonId,
    pub action: String,
    pub context: String,
    pub outcome: Outcome,
    pub insight: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub applied: bool,
    #[serde(default)]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub applied_count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewLesson {
    pub action: String,
    pub context: String,
    pub outcome: Outcome,
    pub insight: String,
}

impl NewLesson {
    pub fn new(
        action: impl Into<String>,
        context: impl Into<String>,
        outcome: Outcome,
        insight: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            context: context.into(),
            outcome,
            insight: insight.into(),
        }
    }
}

impl Lesson {
    pub fn new(draft: NewLesson, now: DateTime<Utc>) -> Result<Self, ValidationError> {
        Ok(Self {
            id: generate_lesson_id(),
            action: require_text("action", &draft.action)?,
            context: require_text("context", &draft.context)?,
            outcome: draft.outcome,
            insight: require_text("insight", &draft.insight)?,
            created_at: now,
            applied: false,
            applied_at: None,
            applied_count: 0,
        })
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text("action", &self.action)?;
        require_text("context", &self.context)?;
        require_text("insight", &self.insight)?;
        if self.applied != self.applied_at.is_some() {
            return Err(ValidationError::Invalid(format!(
                "lesson {} has inconsistent applied state",
                self.id
            )));
        }
        check_timestamp("created_at", &self.created_at)?;
        if let Some(at) = &self.applied_at {
            check_timestamp("applied_at", at)?;
        }
        Ok(())
    }

    pub fn mark_applied(&mut self, now: DateTime<Utc>) {
        self.applied = true;
        self.applied_at = Some(now);
        self.applied_count += 1;
    }
}

// ============================================================================
// Entity Schema
// ============================================================================

/// Schema-less attribute value. Serialized untagged so JSON stays natural.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Number(f64),
    String(String),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AttributeValue::Bool(value) => write!(f, "{}", value),
            AttributeValue::Number(value) => write!(f, "{}", value),
            AttributeValue::String(value) => f.write_str(value),
        }
    }
}

/// Loose parse for command-line input: bool, then number, then string.
impl FromStr for AttributeValue {
    type Err = Infallible;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "true" => return Ok(AttributeValue::Bool(true)),
            "false" => return Ok(AttributeValue::Bool(false)),
            _ => {}
        }
        match raw.parse::<f64>() {
            Ok(number) if number.is_finite() => Ok(AttributeValue::Number(number)),
            _ => Ok(AttributeValue::String(raw.to_string())),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Number(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Number(value as f64)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

pub type Attributes = BTreeMap<String, AttributeValue>;

/// Build an attribute map from `(key, value)` pairs.
pub fn attributes<I, K, V>(pairs: I) -> Attributes
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<AttributeValue>,
{
    pairs
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect()
}

fn check_attributes(attributes: &Attributes) -> Result<(), ValidationError> {
    for (key, value) in attributes {
        require_text("attribute key", key)?;
        if let AttributeValue::Number(number) = value {
            if !number.is_finite() {
                return Err(ValidationError::Invalid(format!(
                    "attribute '{}' must be a finite number",
                    key
                )));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub entity_type: String,
    #[serde(default)]
    pub attributes: Attributes,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(
        name: &str,
        entity_type: &str,
        attributes: Attributes,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        check_attributes(&attributes)?;
        Ok(Self {
            id: generate_entity_id(),
            name: require_text("name", name)?,
            entity_type: normalize_entity_type(entity_type)?,
            attributes,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text("name", &self.name)?;
        require_text("entity_type", &self.entity_type)?;
        check_timestamp("created_at", &self.created_at)?;
        check_timestamp("updated_at", &self.updated_at)?;
        check_attributes(&self.attributes)
    }

    /// Key-by-key merge: incoming values win, untouched keys survive.
    pub fn merge_attributes(
        &mut self,
        incoming: Attributes,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        check_attributes(&incoming)?;
        self.attributes.extend(incoming);
        self.updated_at = now;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityFactLink {
    pub entity_id: EntityId,
    pub fact_id: FactId,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Stats and Snapshot Types
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub active_facts: usize,
    pub superseded_facts: usize,
    pub deleted_facts: usize,
    /// Still `active` in storage but past `expires_at`.
    pub expired_facts: usize,
    pub total_facts: usize,
    pub lessons: usize,
    pub applied_lessons: usize,
    pub entities: usize,
    pub links: usize,
}

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Full structural export of a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub format_version: u32,
    pub exported_at: DateTime<Utc>,
    #[serde(default)]
    pub facts: Vec<Fact>,
    #[serde(default)]
    pub lessons: Vec<Lesson>,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub links: Vec<EntityFactLink>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub facts_imported: usize,
    pub facts_skipped: usize,
    pub lessons_imported: usize,
    pub lessons_skipped: usize,
    pub entities_imported: usize,
    pub entities_merged: usize,
    pub links_imported: usize,
}

// ============================================================================
// Helper Functions
// ============================================================================

pub fn generate_fact_id() -> FactId {
    FactId(format!("fact_{}", ulid::Ulid::new()))
}

pub fn generate_lesson_id() -> LessonId {
    LessonId(format!("lesson_{}", ulid::Ulid::new()))
}

pub fn generate_entity_id() -> EntityId {
    EntityId(format!("ent_{}", ulid::Ulid::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_id_generation() {
        let fact_id = generate_fact_id();
        assert!(fact_id.0.starts_with("fact_"));
        assert_eq!(fact_id.0.len(), 31); // "fact_" + 26 chars

        let lesson_id = generate_lesson_id();
        assert!(lesson_id.0.starts_with("lesson_"));

        let entity_id = generate_entity_id();
        assert!(entity_id.0.starts_with("ent_"));
    }

    #[test]
    fn test_confidence_bounds() {
        let now = Utc::now();
        for confidence in [0.0, 0.25, 0.5, 1.0] {
            assert!(Fact::new(NewFact::new("bounded").confidence(confidence), now).is_ok());
        }

        for confidence in [1.1, -0.1, f64::NAN] {
            let err = Fact::new(NewFact::new("unbounded").confidence(confidence), now)
                .unwrap_err();
            assert!(matches!(err, ValidationError::ConfidenceOutOfRange(_)));
        }
    }

    #[test]
    fn test_fact_construction() {
        let now = Utc::now();
        let fact = Fact::new(
            NewFact::new("  API rate limit is 100 req/min ")
                .tags(["technical", "api", "technical"])
                .source(FactSource::Observation)
                .expires_in_days(7),
            now,
        )
        .unwrap();

        assert_eq!(fact.content, "API rate limit is 100 req/min");
        assert_eq!(fact.tags, vec!["api".to_string(), "technical".to_string()]);
        assert_eq!(fact.status, FactStatus::Active);
        assert_eq!(fact.access_count, 0);
        assert_eq!(fact.expires_at, Some(now + Duration::days(7)));
        assert!(fact.is_live(now));
        assert!(!fact.is_live(now + Duration::days(8)));
    }

    #[test]
    fn test_expiry_span_is_bounded() {
        let now = Utc::now();
        let longest = Fact::new(NewFact::new("century").expires_in_days(MAX_EXPIRY_DAYS), now)
            .unwrap();
        assert_eq!(
            longest.expires_at,
            Some(now + Duration::days(i64::from(MAX_EXPIRY_DAYS)))
        );

        for days in [MAX_EXPIRY_DAYS + 1, 3_000_000, u32::MAX] {
            let err = Fact::new(NewFact::new("forever").expires_in_days(days), now).unwrap_err();
            assert!(matches!(err, ValidationError::Invalid(_)));
        }
    }

    #[test]
    fn test_validate_rejects_five_digit_years() {
        let now = Utc::now();
        let mut fact = Fact::new(NewFact::new("far future"), now).unwrap();
        fact.expires_at = Some(now + Duration::days(3_000_000));
        assert!(fact.validate().is_err());

        let mut entity = Entity::new("Alice", "person", Attributes::new(), now).unwrap();
        entity.updated_at = now + Duration::days(3_000_000);
        assert!(entity.validate().is_err());
    }

    #[test]
    fn test_empty_text_rejected() {
        let now = Utc::now();
        assert_eq!(
            Fact::new(NewFact::new("   "), now).unwrap_err(),
            ValidationError::EmptyField { field: "content" }
        );
        assert!(Fact::new(NewFact::new("x").tags([""]), now).is_err());
        assert!(Fact::new(NewFact::new("x").expires_in_days(0), now).is_err());

        let lesson = Lesson::new(NewLesson::new("did it", "ops", Outcome::Neutral, ""), now);
        assert_eq!(
            lesson.unwrap_err(),
            ValidationError::EmptyField { field: "insight" }
        );
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!("Negative".parse::<Outcome>().unwrap(), Outcome::Negative);
        assert_eq!(
            "inference".parse::<FactSource>().unwrap(),
            FactSource::Inference
        );
        assert!(matches!(
            "great".parse::<Outcome>(),
            Err(ValidationError::UnknownVariant { kind: "outcome", .. })
        ));
        assert!("rumor".parse::<FactSource>().is_err());
        assert!("gone".parse::<FactStatus>().is_err());
    }

    #[test]
    fn test_fact_update_carries_forward() {
        let now = Utc::now();
        let old = Fact::new(
            NewFact::new("old")
                .tags(["ops"])
                .source(FactSource::Inference)
                .confidence(0.4),
            now,
        )
        .unwrap();

        let carried = FactUpdate::new("new").into_new_fact(&old);
        assert_eq!(carried.tags, vec!["ops".to_string()]);
        assert_eq!(carried.source, FactSource::Inference);
        assert_eq!(carried.confidence, 0.4);

        let overridden = FactUpdate::new("new")
            .tags(["infra"])
            .confidence(0.9)
            .into_new_fact(&old);
        assert_eq!(overridden.tags, vec!["infra".to_string()]);
        assert_eq!(overridden.confidence, 0.9);
    }

    #[test]
    fn test_validate_status_pointer_consistency() {
        let now = Utc::now();
        let mut fact = Fact::new(NewFact::new("pointer"), now).unwrap();
        assert!(fact.validate().is_ok());

        fact.status = FactStatus::Superseded;
        assert!(fact.validate().is_err());

        fact.superseded_by = Some(fact.id.clone());
        assert!(fact.validate().is_err());

        fact.superseded_by = Some(generate_fact_id());
        assert!(fact.validate().is_ok());
    }

    #[test]
    fn test_entity_merge() {
        let now = Utc::now();
        let mut entity =
            Entity::new("Alice", "Person", attributes([("team", "eng")]), now).unwrap();
        assert_eq!(entity.entity_type, "person");

        entity
            .merge_attributes(attributes([("expertise", "backend")]), now)
            .unwrap();
        entity
            .merge_attributes(attributes([("team", "platform")]), now)
            .unwrap();

        assert_eq!(entity.attributes.len(), 2);
        assert_eq!(entity.attributes["team"].as_str(), Some("platform"));
        assert_eq!(entity.attributes["expertise"].as_str(), Some("backend"));

        let bad = attributes([("score", f64::INFINITY)]);
        assert!(entity.merge_attributes(bad, now).is_err());
    }

    #[test]
    fn test_attribute_value_serialization() {
        let attrs: Attributes = attributes([
            ("team", AttributeValue::from("eng")),
            ("level", AttributeValue::from(3_i64)),
            ("remote", AttributeValue::from(true)),
        ]);

        let json = serde_json::to_string(&attrs).unwrap();
        assert_eq!(json, r#"{"level":3.0,"remote":true,"team":"eng"}"#);

        let restored: Attributes = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, attrs);

        assert_eq!("true".parse::<AttributeValue>().unwrap(), AttributeValue::Bool(true));
        assert_eq!("2.5".parse::<AttributeValue>().unwrap(), AttributeValue::Number(2.5));
        assert_eq!(
            "NaN".parse::<AttributeValue>().unwrap(),
            AttributeValue::String("NaN".into())
        );
    }

    #[test]
    fn test_lesson_apply() {
        let now = Utc::now();
        let mut lesson = Lesson::new(
            NewLesson::new(
                "Deployed without tests",
                "deployment",
                Outcome::Negative,
                "Run tests first",
            ),
            now,
        )
        .unwrap();
        assert!(!lesson.applied);

        lesson.mark_applied(now);
        lesson.mark_applied(now);
        assert!(lesson.applied);
        assert_eq!(lesson.applied_count, 2);
        assert!(lesson.validate().is_ok());
    }

    #[test]
    fn test_snapshot_serialization() {
        let now = Utc::now();
        let fact = Fact::new(NewFact::new("Example content").tags(["demo"]), now).unwrap();
        let entity = Entity::new("memory-layer", "project", Attributes::new(), now).unwrap();

        let snapshot = MemorySnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            exported_at: now,
            links: vec![EntityFactLink {
                entity_id: entity.id.clone(),
                fact_id: fact.id.clone(),
                created_at: now,
            }],
            facts: vec![fact],
            lessons: vec![],
            entities: vec![entity],
        };

        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: MemorySnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, snapshot);
    }
}
