/// Command-line access to an agent memory store.
///
/// Usage:
///   agent-memory [--db <path>] <fact|lesson|entity|stats|export|import> ...
///
/// The store location defaults to `$AGENT_MEMORY_DB_PATH`, then
/// `~/.agent-memory/memory.db`. Results are printed as JSON on stdout;
/// logs go to stderr (`RUST_LOG` overrides the default `warn` level).
use agent_memory_store::config::DB_PATH_ENV;
use agent_memory_store::{
    AttributeValue, Attributes, FactId, FactSource, FactUpdate, LessonFilter, LessonId,
    MemoryStore, NewFact, NewLesson, Outcome, RecallQuery, StoreConfig,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "agent-memory")]
#[command(about = "Remember facts, learn lessons and track entities across agent sessions")]
struct Cli {
    /// Path to the SQLite store file
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store, search and retire facts
    Fact {
        #[command(subcommand)]
        command: FactCommand,
    },
    /// Record and query lessons learned
    Lesson {
        #[command(subcommand)]
        command: LessonCommand,
    },
    /// Track people, projects and other subjects
    Entity {
        #[command(subcommand)]
        command: EntityCommand,
    },
    /// Show record counts
    Stats,
    /// Dump the whole store as JSON
    Export {
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Load a JSON export into the store
    Import { file: PathBuf },
}

#[derive(Subcommand, Debug)]
enum FactCommand {
    Add {
        content: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long, default_value = "conversation")]
        source: FactSource,
        #[arg(long, default_value_t = 1.0)]
        confidence: f64,
        /// Days until the fact expires
        #[arg(long)]
        expires: Option<u32>,
    },
    Recall {
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        min_confidence: Option<f64>,
        /// Only facts linked to this entity (name or id)
        #[arg(long)]
        entity: Option<String>,
    },
    Get {
        id: String,
    },
    List {
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Include superseded and deleted facts
        #[arg(long)]
        all: bool,
    },
    Supersede {
        id: String,
        content: String,
    },
    Forget {
        id: String,
    },
    ForgetStale {
        #[arg(long, default_value_t = 30)]
        days: u32,
        #[arg(long, default_value_t = 1)]
        min_access: u64,
    },
    /// Permanently remove superseded and deleted facts
    Purge {
        #[arg(long)]
        days: u32,
    },
}

#[derive(Subcommand, Debug)]
enum LessonCommand {
    Add {
        action: String,
        context: String,
        outcome: Outcome,
        insight: String,
    },
    List {
        #[arg(long)]
        context: Option<String>,
        #[arg(long)]
        outcome: Option<Outcome>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    Search {
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    Apply {
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum EntityCommand {
    Track {
        name: String,
        entity_type: String,
        /// Attribute as key=value; repeatable
        #[arg(long = "attr", value_parser = parse_attribute)]
        attrs: Vec<(String, AttributeValue)>,
    },
    Get {
        name: String,
        #[arg(long = "type")]
        entity_type: Option<String>,
    },
    List {
        #[arg(long = "type")]
        entity_type: Option<String>,
    },
    Find {
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    Link {
        /// Entity name or id
        entity: String,
        fact_id: String,
    },
    Facts {
        /// Entity name or id
        entity: String,
    },
}

fn parse_attribute(raw: &str) -> std::result::Result<(String, AttributeValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("attribute key is empty in '{}'", raw));
    }
    let value = match value.parse::<AttributeValue>() {
        Ok(value) => value,
        Err(never) => match never {},
    };
    Ok((key.to_string(), value))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let db_override = cli.db.as_ref().map(|path| path.display().to_string());
    let config = StoreConfig::from_lookup(|key| {
        if key == DB_PATH_ENV && db_override.is_some() {
            return db_override.clone();
        }
        std::env::var(key).ok()
    })?;
    debug!("Store location: {:?}", config.location);

    let store = MemoryStore::open(config).context("failed to open memory store")?;
    run(&store, cli.command)?;
    store.close()?;
    Ok(())
}

fn run(store: &MemoryStore, command: Command) -> Result<()> {
    match command {
        Command::Fact { command } => run_fact(store, command),
        Command::Lesson { command } => run_lesson(store, command),
        Command::Entity { command } => run_entity(store, command),
        Command::Stats => print_json(&store.stats()?),
        Command::Export { output } => {
            let json = store.export_json()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    print_json(&json!({ "exported_to": path, "stats": store.stats()? }))
                }
                None => {
                    println!("{}", json);
                    Ok(())
                }
            }
        }
        Command::Import { file } => {
            let json = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            print_json(&store.import_json(&json)?)
        }
    }
}

fn run_fact(store: &MemoryStore, command: FactCommand) -> Result<()> {
    match command {
        FactCommand::Add {
            content,
            tags,
            source,
            confidence,
            expires,
        } => {
            let mut draft = NewFact::new(content)
                .tags(tags)
                .source(source)
                .confidence(confidence);
            if let Some(days) = expires {
                draft = draft.expires_in_days(days);
            }
            print_json(&store.remember(draft)?)
        }
        FactCommand::Recall {
            query,
            limit,
            tags,
            min_confidence,
            entity,
        } => {
            let mut recall = RecallQuery::new(query).limit(limit).tags(tags);
            if let Some(min) = min_confidence {
                recall = recall.min_confidence(min);
            }
            if let Some(entity) = entity {
                recall = recall.entity(entity);
            }
            print_json(&store.recall(&recall)?)
        }
        FactCommand::Get { id } => print_json(&store.get_fact(&FactId(id))?),
        FactCommand::List { tags, limit, all } => print_json(&store.list_facts(&tags, limit, all)?),
        FactCommand::Supersede { id, content } => {
            print_json(&store.supersede(&FactId(id), FactUpdate::new(content))?)
        }
        FactCommand::Forget { id } => print_json(&store.forget(&FactId(id))?),
        FactCommand::ForgetStale { days, min_access } => {
            let forgotten = store.forget_stale(days, min_access)?;
            print_json(&json!({ "forgotten": forgotten }))
        }
        FactCommand::Purge { days } => {
            let purged = store.purge(days)?;
            print_json(&json!({ "purged": purged }))
        }
    }
}

fn run_lesson(store: &MemoryStore, command: LessonCommand) -> Result<()> {
    match command {
        LessonCommand::Add {
            action,
            context,
            outcome,
            insight,
        } => print_json(&store.learn(NewLesson::new(action, context, outcome, insight))?),
        LessonCommand::List {
            context,
            outcome,
            limit,
        } => {
            let mut filter = LessonFilter::new().limit(limit);
            if let Some(context) = context {
                filter = filter.context(context);
            }
            if let Some(outcome) = outcome {
                filter = filter.outcome(outcome);
            }
            print_json(&store.get_lessons(&filter)?)
        }
        LessonCommand::Search { query, limit } => print_json(&store.search_lessons(&query, limit)?),
        LessonCommand::Apply { id } => print_json(&store.apply_lesson(&LessonId(id))?),
    }
}

fn run_entity(store: &MemoryStore, command: EntityCommand) -> Result<()> {
    match command {
        EntityCommand::Track {
            name,
            entity_type,
            attrs,
        } => {
            let attributes: Attributes = attrs.into_iter().collect();
            print_json(&store.track_entity(&name, &entity_type, attributes)?)
        }
        EntityCommand::Get { name, entity_type } => {
            print_json(&store.get_entity(&name, entity_type.as_deref())?)
        }
        EntityCommand::List { entity_type } => {
            print_json(&store.list_entities(entity_type.as_deref())?)
        }
        EntityCommand::Find { query, limit } => print_json(&store.find_entities(&query, limit)?),
        EntityCommand::Link { entity, fact_id } => {
            let created = store.link_fact_to_entity(&entity, &FactId(fact_id.clone()))?;
            print_json(&json!({ "entity": entity, "fact_id": fact_id, "created": created }))
        }
        EntityCommand::Facts { entity } => print_json(&store.facts_for_entity(&entity)?),
    }
}
