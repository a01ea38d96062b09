use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hermes::config::{load_config, HermesConfig};
use hermes::indexer;
use hermes::models::{BiEncoder, CrossEncoder, LexicalReranker, StaticModelEncoder};
use hermes::pipeline::SearchPipeline;
use hermes::schemas::{RetrievalMode, SearchRequest};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hermes")]
#[command(version)]
#[command(about = "Code-search engine: index a repository, then query it with hybrid retrieval")]
struct Cli {
    /// Optional JSON config file; HERMES_* environment variables override it.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan, chunk, embed and build the index artifacts for a repository.
    Index {
        /// Path to the repository to index.
        #[arg(long)]
        repo: PathBuf,
        /// Output directory for artifacts.
        #[arg(long, default_value = "artifacts")]
        out: PathBuf,
    },
    /// Run one query against existing artifacts and print the response JSON.
    Search {
        /// Query text.
        query: String,
        #[arg(long, default_value = "artifacts")]
        artifacts: PathBuf,
        /// Retrieval mode: dense, sparse or hybrid (default from config).
        #[arg(long)]
        mode: Option<String>,
        #[arg(long)]
        top_k: Option<usize>,
        /// Only return chunks with this language tag.
        #[arg(long)]
        language: Option<String>,
        /// Only return chunks whose path starts with this prefix.
        #[arg(long)]
        path_prefix: Option<String>,
        /// Omit code snippets from the output.
        #[arg(long)]
        no_snippets: bool,
    },
    /// Print index and cache statistics for an artifacts directory.
    Stats {
        #[arg(long, default_value = "artifacts")]
        artifacts: PathBuf,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_cli_config(path: Option<&PathBuf>, artifacts_dir: &PathBuf) -> Result<HermesConfig> {
    let mut config = load_config(path.map(|p| p.as_path())).context("loading configuration")?;
    config.artifacts_dir = artifacts_dir.clone();
    Ok(config)
}

fn open_pipeline(config: HermesConfig) -> Result<SearchPipeline> {
    let biencoder: Arc<dyn BiEncoder> = Arc::new(
        StaticModelEncoder::load(&config.embed.biencoder_model)
            .context("loading bi-encoder model")?,
    );
    let crossencoder: Arc<dyn CrossEncoder> = Arc::new(LexicalReranker);
    SearchPipeline::open(config, biencoder, crossencoder).context("opening search pipeline")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Index { repo, out } => {
            let config = load_cli_config(cli.config.as_ref(), &out)?;
            let encoder = StaticModelEncoder::load(&config.embed.biencoder_model)
                .context("loading bi-encoder model")?;

            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::with_template("{spinner} {pos} files chunked ({msg})")
                    .expect("valid progress template"),
            );

            indexer::reset_indexing();
            if !indexer::begin_indexing(&repo) {
                anyhow::bail!("an indexing run is already in progress");
            }
            let summary = match indexer::build_index_with_progress(
                &repo,
                &config,
                &encoder,
                |file| {
                    bar.inc(1);
                    bar.set_message(file.rel_path.clone());
                },
            ) {
                Ok(summary) => {
                    indexer::finish_indexing(summary.clone());
                    summary
                }
                Err(e) => {
                    indexer::fail_indexing(e.to_string());
                    return Err(e).context("indexing failed");
                }
            };
            bar.finish_and_clear();

            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Command::Search {
            query,
            artifacts,
            mode,
            top_k,
            language,
            path_prefix,
            no_snippets,
        } => {
            let config = load_cli_config(cli.config.as_ref(), &artifacts)?;
            let pipeline = open_pipeline(config)?;

            let mut request = SearchRequest::new(query);
            if let Some(mode) = mode {
                request.retrieval_mode = Some(mode.parse::<RetrievalMode>()?);
            }
            if let Some(top_k) = top_k {
                request.top_k_rerank = top_k;
            }
            request.filter_language = language;
            request.filter_path_prefix = path_prefix;
            request.return_snippets = !no_snippets;

            let response = pipeline.search(&request).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }

        Command::Stats { artifacts } => {
            let config = load_cli_config(cli.config.as_ref(), &artifacts)?;
            let pipeline = open_pipeline(config)?;
            let stats = pipeline.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
