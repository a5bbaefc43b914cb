use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mnemon_config::AppConfig;
use mnemon_memory::{
    EngineSettings, ProfileMemory, RedbProfileStore, Resource, ResourceDefinition,
    ResourceInitializer,
};

#[derive(Debug, Parser)]
#[command(
    name = "mnemon",
    version,
    about = "A persistent user-profile memory engine"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "mnemon.toml", global = true)]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the memory engine until interrupted (default).
    Serve,
    /// Write a default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Print the number of history messages awaiting ingestion.
    Pending,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.telemetry.log_level.clone())),
        )
        .init();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Init { force } => init_config(&cli.config, &config, force),
        Commands::Pending => pending(config).await,
    }
}

fn init_config(path: &str, config: &AppConfig, force: bool) -> Result<()> {
    if std::path::Path::new(path).exists() && !force {
        bail!("{path} already exists; pass --force to overwrite");
    }
    config.save_to(path)?;
    println!("wrote {path}");
    Ok(())
}

fn build_engine(config: &AppConfig) -> Result<ProfileMemory> {
    let mut definitions = BTreeMap::new();
    definitions.insert(
        "embedder".to_string(),
        ResourceDefinition {
            kind: "embedder".to_string(),
            name: config.embedder.provider.clone(),
            config: json!({
                "model": config.embedder.model,
                "dimensions": config.embedder.dimensions,
                "base_url": config.embedder.base_url,
                "api_key_env": config.embedder.api_key_env,
            }),
        },
    );
    definitions.insert(
        "language_model".to_string(),
        ResourceDefinition {
            kind: "language_model".to_string(),
            name: config.language_model.provider.clone(),
            config: json!({
                "model": config.language_model.model,
                "base_url": config.language_model.base_url,
                "api_key_env": config.language_model.api_key_env,
            }),
        },
    );
    let resources = ResourceInitializer::initialize(&definitions)?;

    let embedder = resources
        .get("embedder")
        .and_then(Resource::as_embedder)
        .context("embedder resource was not built")?;
    let model = resources
        .get("language_model")
        .and_then(Resource::as_language_model)
        .context("language model resource was not built")?;

    let Some(prompts) = mnemon_prompt::bundle(&config.prompt.module) else {
        bail!(
            "unknown prompt module '{}'; expected one of {:?}",
            config.prompt.module,
            mnemon_prompt::BUNDLE_NAMES
        );
    };

    let storage = Arc::new(RedbProfileStore::new(
        &config.storage.path,
        config.storage.max_concurrent_transactions,
    )?);

    let settings = EngineSettings {
        max_cache_size: config.profile.max_cache_size,
        update_interval_sec: config.profile.update_interval_sec,
        message_limit: config.profile.message_limit,
        time_limit_sec: config.profile.time_limit_sec,
        consolidation_threshold: config.profile.consolidation_threshold,
        history_batch_size: config.profile.history_batch_size,
        embed_feature_in_value: config.profile.embed_feature_in_value,
        llm_max_attempts: config.language_model.max_attempts,
        embed_max_attempts: config.embedder.max_attempts,
    };

    Ok(ProfileMemory::new(model, embedder, prompts, storage, settings)?)
}

async fn serve(config: AppConfig) -> Result<()> {
    let memory = build_engine(&config)?;
    memory.startup().await?;
    info!(
        storage = %config.storage.path,
        prompt_module = %config.prompt.module,
        "mnemon is running; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down");
    memory.shutdown().await?;
    Ok(())
}

async fn pending(config: AppConfig) -> Result<()> {
    let storage = Arc::new(RedbProfileStore::new(
        &config.storage.path,
        config.storage.max_concurrent_transactions,
    )?);
    use mnemon_memory::ProfileStorage;
    storage.startup().await?;
    let count = storage.get_uningested_history_messages_count().await?;
    println!("{count}");
    storage.cleanup().await?;
    Ok(())
}
