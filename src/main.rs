//! dochub CLI

use clap::{Parser, Subcommand};
use dochub::query::sql::Param;
use dochub::schema::load_models;
use dochub::{DocRef, DocumentContext, Hub, HubConfig, PendingChange, PluginRegistry, RequestContext, Resource, Schema};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "dochub")]
#[command(about = "A schema-driven document hub backed by postgres", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "DOCHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Postgres connection string (overrides the config file)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Directory of schema model files (overrides the config file)
    #[arg(short, long)]
    schema_dir: Option<PathBuf>,

    /// Branch to work on (defaults to the configured default branch)
    #[arg(short, long)]
    branch: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the tables and index every data source
    Setup,

    /// Load the schema models and report what they define
    CheckSchema,

    /// Validate a pending change against the schema
    Validate {
        /// JSON file holding {"original": doc, "final": doc}
        #[arg(long)]
        change: PathBuf,

        /// JSON file holding the requesting user resource
        #[arg(long)]
        user: Option<PathBuf>,
    },

    /// Print the SQL a search request compiles to
    Compile {
        /// Search request as JSON: {"filter": ..., "sort": ..., "page": ...}
        #[arg(long)]
        query: String,

        #[arg(long)]
        user: Option<PathBuf>,
    },

    /// Run a search request
    Search {
        #[arg(long)]
        query: String,

        #[arg(long)]
        user: Option<PathBuf>,
    },

    /// Fetch one document
    Get {
        #[arg(value_name = "TYPE")]
        kind: String,

        id: String,

        /// Fieldset format used to pick included resources
        #[arg(long)]
        format: Option<String>,

        #[arg(long)]
        user: Option<PathBuf>,
    },

    /// Delete rows of a source not stamped with a generation
    Gc {
        #[arg(long)]
        source: String,

        #[arg(long)]
        generation: i64,
    },
}

/// Change file contents; either side may be absent
#[derive(Deserialize)]
struct ChangeFile {
    original: Option<DocumentContext>,
    #[serde(rename = "final")]
    final_document: Option<DocumentContext>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let branch = cli.branch.clone().unwrap_or_else(|| config.default_branch.clone());

    match cli.command {
        Commands::Setup => setup(config, &branch).await,
        Commands::CheckSchema => check_schema(&config),
        Commands::Validate { change, user } => validate(&config, &change, user.as_deref()),
        Commands::Compile { query, user } => compile(&config, &branch, &query, user.as_deref()),
        Commands::Search { query, user } => search(config, &branch, &query, user.as_deref()).await,
        Commands::Get {
            kind,
            id,
            format,
            user,
        } => get(config, &branch, DocRef::new(kind, id), format.as_deref(), user.as_deref()).await,
        Commands::Gc { source, generation } => gc(config, &branch, &source, generation).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<HubConfig> {
    let mut config = match &cli.config {
        Some(path) => HubConfig::load(path)?,
        None => HubConfig::default(),
    };
    if let Some(url) = &cli.database_url {
        config.database_url = Some(url.clone());
    }
    if let Some(dir) = &cli.schema_dir {
        config.schema_dir = Some(dir.clone());
    }
    Ok(config)
}

/// Schema from the configured directory only, without a database
fn offline_schema(config: &HubConfig) -> anyhow::Result<Schema> {
    let models = match &config.schema_dir {
        Some(dir) => load_models(dir)?,
        None => anyhow::bail!("no schema directory given; pass --schema-dir or set schema_dir"),
    };
    Ok(Schema::load(models, Arc::new(PluginRegistry::with_builtins()))?)
}

fn request_context(user: Option<&Path>) -> anyhow::Result<RequestContext> {
    let Some(path) = user else {
        return Ok(RequestContext::anonymous());
    };
    let content = std::fs::read_to_string(path)?;
    let user: Resource = serde_json::from_str(&content)?;
    Ok(RequestContext::for_user(user))
}

/// Print a library error the way an API client would see it
fn report(err: &dochub::Error) {
    match serde_json::to_string_pretty(&serde_json::json!({ "errors": [err.to_json_api()] })) {
        Ok(rendered) => eprintln!("{}", rendered),
        Err(_) => eprintln!("Error: {}", err),
    }
    if let Some(hint) = err.suggestion() {
        eprintln!("Hint: {}", hint);
    }
}

async fn setup(config: HubConfig, branch: &str) -> anyhow::Result<()> {
    let hub = Hub::open(config).await?;
    println!("Tables ready.");
    let deleted = hub.reindex(branch).await?;
    println!("Indexed every data source on '{}' ({} stale row(s) removed).", branch, deleted);
    Ok(())
}

fn check_schema(config: &HubConfig) -> anyhow::Result<()> {
    let schema = offline_schema(config)?;
    println!("Schema OK");
    println!("  types:           {}", schema.types.len());
    println!("  fields:          {}", schema.fields.len());
    println!("  computed fields: {}", schema.computed_fields.len());
    println!("  grants:          {}", schema.grants.len());
    println!("  groups:          {}", schema.groups.len());
    println!("  data sources:    {}", schema.data_sources.len());
    let mut types: Vec<_> = schema.types.keys().collect();
    types.sort();
    for name in types {
        println!("  - {}", name);
    }
    Ok(())
}

fn validate(config: &HubConfig, change: &Path, user: Option<&Path>) -> anyhow::Result<()> {
    let schema = offline_schema(config)?;
    let context = request_context(user)?;
    let file: ChangeFile = serde_json::from_str(&std::fs::read_to_string(change)?)?;

    let mut pending = PendingChange::default();
    if let Some(original) = file.original {
        pending.original_document = Some(original.data);
        pending.original_included = original.included;
    }
    if let Some(final_document) = file.final_document {
        pending.final_document = Some(final_document.data);
        pending.final_included = final_document.included;
    }

    match schema.validate(&mut pending, &context) {
        Ok(next) => {
            println!("Valid.");
            if next.is_some() {
                println!("This change rebuilds the schema.");
            }
            if let Some(document) = pending.final_document_context() {
                println!("{}", serde_json::to_string_pretty(&document)?);
            }
            Ok(())
        }
        Err(err) => {
            report(&err);
            std::process::exit(1);
        }
    }
}

fn compile(config: &HubConfig, branch: &str, query: &str, user: Option<&Path>) -> anyhow::Result<()> {
    let schema = offline_schema(config)?;
    let context = request_context(user)?;
    let query = hubql::parse_str(query)?;
    let searcher = dochub::Searcher::new(config.page_size, config.max_page_size);
    let compiled = searcher.compile(&schema, branch, &query, &schema.user_realms(&context))?;

    println!("{}", compiled.sql.text);
    for (i, value) in compiled.sql.values.iter().enumerate() {
        let shown = match value {
            Param::Text(s) => format!("{:?}", s),
            Param::TextArray(items) => format!("{:?}", items),
            Param::Json(v) => v.to_string(),
            Param::BigInt(n) => n.to_string(),
        };
        println!("  ${} = {}", i + 1, shown);
    }
    Ok(())
}

async fn search(config: HubConfig, branch: &str, query: &str, user: Option<&Path>) -> anyhow::Result<()> {
    let query = hubql::parse_str(query)?;
    let context = request_context(user)?;
    let hub = Hub::open(config).await?;
    match hub.search(branch, &query, &context).await {
        Ok(page) => {
            println!("{}", serde_json::to_string_pretty(&page)?);
            Ok(())
        }
        Err(err) => {
            report(&err);
            std::process::exit(1);
        }
    }
}

async fn get(
    config: HubConfig,
    branch: &str,
    target: DocRef,
    format: Option<&str>,
    user: Option<&Path>,
) -> anyhow::Result<()> {
    let context = request_context(user)?;
    let hub = Hub::open(config).await?;
    match hub.get(branch, &target, format, &context).await {
        Ok(document) => {
            println!("{}", serde_json::to_string_pretty(&document)?);
            Ok(())
        }
        Err(err) => {
            report(&err);
            std::process::exit(1);
        }
    }
}

async fn gc(config: HubConfig, branch: &str, source: &str, generation: i64) -> anyhow::Result<()> {
    let hub = Hub::open(config).await?;
    let deleted = hub.gc(branch, source, generation).await?;
    println!("{} row(s) deleted.", deleted);
    Ok(())
}
