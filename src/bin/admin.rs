//! Request Orchestrator Admin CLI
//!
//! Offline tooling for the registry document and runtime configuration:
//! validate a registry before deploying it, dry-run the classifier and
//! resolver against a piece of text, and print the effective configuration.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use request_orchestrator::engine::{
    ChainResolver, ConfigSource, IntentClassifier, JsonFileConfigSource, RegistrySnapshot,
};
use request_orchestrator::OrchestratorConfig;
use serde_json::{Map, Value};

#[derive(Parser)]
#[command(name = "orchestrator-admin")]
#[command(about = "Request Orchestrator Admin CLI - Validate registries and inspect routing")]
#[command(version = "1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Orchestrator configuration file
    #[arg(long, global = true, env = "ORCHESTRATOR_CONFIG")]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run load-time validation on a registry document
    Validate {
        /// Path to the registry JSON document
        registry: String,
    },

    /// Show which intent and steps a piece of text would run
    Classify {
        /// Path to the registry JSON document
        registry: String,

        /// Request text
        text: String,

        /// Request context as a JSON object
        #[arg(long)]
        context: Option<String>,
    },

    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    match cli.command {
        Commands::Validate { registry } => validate(&registry).await,
        Commands::Classify {
            registry,
            text,
            context,
        } => {
            let config = OrchestratorConfig::load(cli.config.as_deref())?;
            classify(&config, &registry, &text, context.as_deref()).await
        }
        Commands::ShowConfig => {
            let config = OrchestratorConfig::load(cli.config.as_deref())?;
            show_config(&config)
        }
    }
}

async fn load_snapshot(path: &str) -> Result<RegistrySnapshot> {
    let document = JsonFileConfigSource::new(path)
        .load()
        .await
        .with_context(|| format!("reading registry {}", path))?;
    Ok(RegistrySnapshot::build(document, 1)?)
}

async fn validate(path: &str) -> Result<()> {
    println!("\n🔍 Validating {}", path);
    println!("=====================================");

    let snapshot = match load_snapshot(path).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            println!("{} {:#}", "❌ Invalid:".red().bold(), e);
            std::process::exit(1);
        }
    };

    println!("Capabilities: {}", snapshot.capabilities().count());
    println!("Intents:      {}", snapshot.intents().len());
    println!("Chains:       {}", snapshot.chains().len());

    if snapshot.warnings().is_empty() {
        println!("\n{}", "✅ Registry is valid".green().bold());
    } else {
        println!("\n{} ({})", "⚠️  Valid with warnings".yellow().bold(), snapshot.warnings().len());
        for warning in snapshot.warnings() {
            println!("   - {}", warning.yellow());
        }
    }
    Ok(())
}

async fn classify(config: &OrchestratorConfig, path: &str, text: &str, context: Option<&str>) -> Result<()> {
    let snapshot = load_snapshot(path).await?;
    let context: Map<String, Value> = match context {
        Some(raw) => serde_json::from_str(raw).context("--context must be a JSON object")?,
        None => Map::new(),
    };

    let intent = IntentClassifier::new().classify(&snapshot, text, &context);
    let resolver = ChainResolver::new(config.max_fallback_hops, config.default_chain_id.clone());
    let resolution = match intent {
        Some(intent) => resolver.resolve_intent(&snapshot, intent, &context),
        None => resolver.resolve_default(&snapshot),
    };

    println!("\n🧭 Routing dry run");
    println!("=====================================");
    println!("Text:   {}", text);
    match intent {
        Some(intent) => println!("Intent: {} (priority {})", intent.key.cyan().bold(), intent.priority),
        None => println!("Intent: {}", "<none, default route>".dimmed()),
    }

    match resolution {
        Ok(route) => {
            println!("Source: {:?}", route.source);
            if let Some(chain) = &route.selected_chain {
                println!("Chain:  {}", chain.cyan());
            }
            if !route.tiers_attempted.is_empty() {
                println!("Tiers:  {}", route.tiers_attempted.join(" → "));
            }
            println!("\nSteps:");
            for (index, step) in route.steps.iter().enumerate() {
                let usable = snapshot.is_usable(&step.function);
                let marker = if usable { "✓".green() } else { "✗".red() };
                println!(
                    "  {} {}. {} (required: {}, on_error: {:?}, wait: {})",
                    marker,
                    index + 1,
                    step.function,
                    step.required,
                    step.on_error,
                    step.wait_for_result
                );
            }
        }
        Err(unroutable) => {
            println!("{} {}", "❌ No route:".red().bold(), unroutable.reason);
            if !unroutable.tiers_attempted.is_empty() {
                println!("Tiers tried: {}", unroutable.tiers_attempted.join(" → "));
            }
        }
    }
    Ok(())
}

fn show_config(config: &OrchestratorConfig) -> Result<()> {
    println!("\n⚙️  Effective configuration");
    println!("=====================================");
    println!("{}", serde_json::to_string_pretty(config)?);
    match config.validate() {
        Ok(()) => println!("\n{}", "✅ Configuration is valid".green()),
        Err(e) => println!("\n{} {}", "❌".red(), e.to_string().red()),
    }
    Ok(())
}
