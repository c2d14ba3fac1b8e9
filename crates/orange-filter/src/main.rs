//! Orange Filter
//!
//! Loads the stored filter config, installs the generated navigation rules
//! and reports how the given URLs would be treated.

use anyhow::{Context, Result};
use clap::Parser;
use orange_config::{get_blocked_count, load_config, FileStorage};
use orange_rules::{DynamicRuleStore, ResourceType, Verdict};
use orange_runtime::update_rules;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "orange-filter")]
#[command(about = "Keyword-driven content filter: rule sync and URL checks")]
#[command(version)]
struct Cli {
    /// Storage file (defaults to the platform data directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// URLs to evaluate as top-level navigations
    urls: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let storage = match cli.config {
        Some(path) => FileStorage::new(path),
        None => FileStorage::with_default_path(),
    };
    info!("Using storage at {}", storage.path().display());

    let config = load_config(&storage).await;
    info!(
        "Filtering {} ({} keywords, {} whitelisted domains, AI mode {})",
        if config.settings.enabled_global { "enabled" } else { "disabled" },
        config.lists.user_keywords.len(),
        config.lists.whitelist.len(),
        config.settings.ai_mode
    );

    let rules = DynamicRuleStore::new();
    update_rules(&storage, &rules).await.context("failed to install rules")?;
    println!("{}", serde_json::to_string_pretty(&rules.rules())?);

    for url in &cli.urls {
        let label = match rules.evaluate(url, ResourceType::MainFrame) {
            Verdict::Block { rule_id } => format!("BLOCK (rule {})", rule_id),
            Verdict::Allow { rule_id: Some(id) } => format!("ALLOW (rule {})", id),
            Verdict::Allow { rule_id: None } => "ALLOW".to_string(),
        };
        println!("{}  {}", label, url);
    }

    info!("Blocked so far: {}", get_blocked_count(&storage).await);
    Ok(())
}
