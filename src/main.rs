//! # ragchat CLI
//!
//! ## Usage
//!
//! ```bash
//! ragchat --config ./config/ragchat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragchat init` | Create the session database and an empty vector store |
//! | `ragchat ingest <FILE>` | Ingest a JSON batch `{docs: [...], overwrite}` |
//! | `ragchat query "<question>"` | Print ranked hits |
//! | `ragchat eval <FILE>` | Print recall@k and p95 latency as JSON |
//! | `ragchat serve` | Start the HTTP server |
//!
//! Without `--config`, `./config/ragchat.toml` is used when present and
//! built-in defaults otherwise.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use ragchat::config::{self, Config};
use ragchat::ingest::IngestRequest;
use ragchat::rag::RagEngine;
use ragchat::{db, migrate, server, telemetry};
use ragchat_core::eval::EvalQuery;

const DEFAULT_CONFIG_PATH: &str = "./config/ragchat.toml";

/// Chat backend with conversation history and a small retrieval-augmented
/// generation engine.
#[derive(Parser)]
#[command(name = "ragchat", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the session database and an empty vector store. Idempotent.
    Init,

    /// Ingest documents from a JSON file.
    Ingest {
        /// File containing `{"docs": [{"id", "department", "text"}], "overwrite": false}`.
        file: PathBuf,

        /// Clear the store before adding.
        #[arg(long)]
        overwrite: bool,
    },

    /// Retrieve the chunks most relevant to a question.
    Query {
        question: String,

        /// Number of hits.
        #[arg(long)]
        k: Option<usize>,

        /// Only return chunks from this department.
        #[arg(long)]
        department: Option<String>,

        /// MMR trade-off: 1.0 is pure relevance, 0.0 pure diversity.
        #[arg(long, conflicts_with = "no_mmr")]
        mmr_lambda: Option<f32>,

        /// Rank by raw similarity.
        #[arg(long)]
        no_mmr: bool,
    },

    /// Evaluate recall@k over a labeled query set.
    Eval {
        /// JSON file: either `[{"q", "expected_doc_id"}]` or `{"queries": [...]}`.
        file: PathBuf,

        #[arg(long)]
        k: Option<usize>,
    },

    /// Start the HTTP server.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    telemetry::init(cli.log_json);

    let cfg = resolve_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;

            let engine = RagEngine::from_config(&cfg)?;
            let count = engine.init_store().await?;
            println!("Database initialized at {}", cfg.db.path.display());
            println!(
                "Vector store ready at {} ({} vectors, model {})",
                cfg.store.dir.display(),
                count,
                engine.model_name()
            );
        }
        Commands::Ingest { file, overwrite } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let mut request: IngestRequest =
                serde_json::from_str(&raw).with_context(|| format!("Invalid ingest file: {}", file.display()))?;
            request.overwrite |= overwrite;

            let engine = RagEngine::from_config(&cfg)?;
            let response = engine.ingest(request).await?;
            println!(
                "Ingested {} chunks (model {})",
                response.ingested, response.emb_model
            );
        }
        Commands::Query {
            question,
            k,
            department,
            mmr_lambda,
            no_mmr,
        } => {
            let engine = RagEngine::from_config(&cfg)?;
            let lambda = if no_mmr {
                None
            } else {
                Some(mmr_lambda.unwrap_or(cfg.retrieval.mmr_lambda))
            };
            let hits = engine
                .query(&question, &engine.params(k, department, lambda))
                .await?;

            if hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in hits.iter().enumerate() {
                println!(
                    "{}. [{:.4}] {} ({})",
                    i + 1,
                    hit.score,
                    hit.chunk_id,
                    hit.department
                );
                println!("   {}", hit.text);
            }
        }
        Commands::Eval { file, k } => {
            let queries = read_eval_file(&file)?;
            let engine = RagEngine::from_config(&cfg)?;
            let metrics = engine
                .eval(&queries, k.unwrap_or(cfg.retrieval.default_k))
                .await?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

fn resolve_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(p) => config::load_config(p),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            config::load_config(Path::new(DEFAULT_CONFIG_PATH))
        }
        None => {
            let mut cfg = Config::minimal();
            cfg.apply_env()?;
            cfg.validate()?;
            Ok(cfg)
        }
    }
}

fn read_eval_file(path: &Path) -> anyhow::Result<Vec<EvalQuery>> {
    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum EvalFile {
        List(Vec<EvalQuery>),
        Wrapped { queries: Vec<EvalQuery> },
    }

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let parsed: EvalFile =
        serde_json::from_str(&raw).with_context(|| format!("Invalid eval file: {}", path.display()))?;
    Ok(match parsed {
        EvalFile::List(queries) | EvalFile::Wrapped { queries } => queries,
    })
}
