use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use prefguard_core::config::{generate_seed, PrefGuardConfig};
use prefguard_core::metrics::{names, MetricsSink, RecordingMetrics, TracingMetrics};
use prefguard_core::paths::{config_path, data_dir, default_profile_dir, local_state_path};
use prefguard_core::pref_store::{JsonPrefStore, PrefMap, PrefReadError, PrefStore};
use prefguard_core::{LocalState, StoreManager};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "prefguard")]
#[command(author, version, about = "Tamper protection for profile preferences", long_about = None)]
struct Cli {
    /// Data directory holding `Local State` and the profiles
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Profile directory (defaults to `<data dir>/Default`)
    #[arg(long, global = true)]
    profile_dir: Option<PathBuf>,

    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a configuration with a fresh seed
    Init {
        /// Replace an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Seed the profile from a master preferences file
    Seed {
        /// JSON object with the initial preference values
        master_prefs: PathBuf,
    },

    /// Load the profile, enforcing policy on tampered preferences
    Verify,

    /// Set a preference (value is parsed as JSON, falling back to a string)
    Set { key: String, value: String },

    /// Print a preference
    Get { key: String },

    /// Drop stored digests so they are re-seeded on next load
    ResetHashes {
        /// Drop the digests of every profile
        #[arg(long)]
        all: bool,
    },

    /// Show when tracked preferences were last reset
    ResetTime {
        /// Clear the recorded time
        #[arg(long)]
        clear: bool,
    },
}

struct Locations {
    config_path: PathBuf,
    data_dir: PathBuf,
    profile_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let data = match cli.data_dir {
        Some(dir) => dir,
        None => data_dir()?,
    };
    let ctx = Locations {
        config_path: match cli.config {
            Some(path) => path,
            None => config_path()?,
        },
        profile_dir: cli
            .profile_dir
            .unwrap_or_else(|| default_profile_dir(&data)),
        data_dir: data,
    };

    match cli.command {
        Commands::Init { force } => init_command(&ctx, force),
        Commands::Seed { master_prefs } => seed_command(&ctx, master_prefs),
        Commands::Verify => verify_command(&ctx).await,
        Commands::Set { key, value } => set_command(&ctx, &key, &value).await,
        Commands::Get { key } => get_command(&ctx, &key).await,
        Commands::ResetHashes { all } => reset_hashes_command(&ctx, all),
        Commands::ResetTime { clear } => reset_time_command(&ctx, clear).await,
    }
}

fn init_command(ctx: &Locations, force: bool) -> Result<()> {
    if ctx.config_path.exists() && !force {
        return Err(anyhow!(
            "configuration already exists at {} (use --force to replace it)",
            ctx.config_path.display()
        ));
    }
    let config = PrefGuardConfig {
        seed: generate_seed(),
        ..Default::default()
    };
    config.save(&ctx.config_path)?;
    std::fs::create_dir_all(&ctx.data_dir)?;
    println!("Configuration written: {}", ctx.config_path.display());
    println!("Tracked preferences: {}", config.tracked.len());
    Ok(())
}

fn load_config(ctx: &Locations) -> Result<PrefGuardConfig> {
    PrefGuardConfig::load(&ctx.config_path)
        .with_context(|| format!("run `prefguard init` to write {}", ctx.config_path.display()))
}

fn open_manager(ctx: &Locations, metrics: Arc<dyn MetricsSink>) -> Result<(StoreManager, Arc<LocalState>)> {
    let config = load_config(ctx)?;
    open_manager_with(ctx, &config, metrics)
}

fn open_manager_with(
    ctx: &Locations,
    config: &PrefGuardConfig,
    metrics: Arc<dyn MetricsSink>,
) -> Result<(StoreManager, Arc<LocalState>)> {
    let local_state = Arc::new(LocalState::load(local_state_path(&ctx.data_dir))?);
    let manager = StoreManager::from_config(&ctx.profile_dir, config, local_state.clone(), metrics)?;
    if !manager.tracking_enabled() {
        warn!("preference tracking is disabled on this platform or by configuration");
    }
    Ok((manager, local_state))
}

async fn open_store(manager: &StoreManager) -> Result<Arc<JsonPrefStore>> {
    let store = manager.create_store(&Handle::current());
    match store.read_prefs().await {
        PrefReadError::None | PrefReadError::NoFile => Ok(store),
        other => Err(anyhow!(
            "cannot load {}: {other:?}",
            manager.pref_file_path().display()
        )),
    }
}

fn seed_command(ctx: &Locations, master_prefs: PathBuf) -> Result<()> {
    let data = std::fs::read(&master_prefs)
        .with_context(|| format!("cannot read {}", master_prefs.display()))?;
    let value: Value = serde_json::from_slice(&data)?;
    let values = PrefMap::from_value(value)
        .ok_or_else(|| anyhow!("{} is not a JSON object", master_prefs.display()))?;
    let (manager, _) = open_manager(ctx, Arc::new(TracingMetrics))?;
    if !manager.initialize_from_master_prefs(&values) {
        return Err(anyhow!("seeding {} failed", manager.profile_path().display()));
    }
    println!("Seeded {}", manager.pref_file_path().display());
    Ok(())
}

async fn verify_command(ctx: &Locations) -> Result<()> {
    let metrics = Arc::new(RecordingMetrics::new());
    let config = load_config(ctx)?;
    let (manager, _) = open_manager_with(ctx, &config, metrics.clone())?;
    let store = open_store(&manager).await?;

    let name_of = |id: usize| {
        config
            .tracked
            .iter()
            .find(|p| p.reporting_id == id)
            .map_or_else(|| format!("#{id}"), |p| p.name.clone())
    };
    let findings = [
        ("changed", names::TRACKED_PREFERENCE_CHANGED),
        ("cleared", names::TRACKED_PREFERENCE_CLEARED),
        ("untrusted", names::TRACKED_PREFERENCE_UNTRUSTED),
        ("reset", names::TRACKED_PREFERENCE_RESET),
        ("diverged during migration", names::TRACKED_PREFERENCE_MIGRATION_DIVERGED),
    ];
    let mut clean = true;
    for (label, metric) in findings {
        for id in metrics.enumeration(metric) {
            clean = false;
            println!("{label}: {}", name_of(id));
        }
    }
    if !metrics.enumeration(names::HASH_STORE_VERSION_UPDATED_FROM).is_empty() {
        println!("digests seeded at {:?}", manager.hash_store_version());
    }
    if clean {
        println!("All tracked preferences verified");
    }
    if let Some(at) = StoreManager::get_reset_time(&*store) {
        println!("Last reset: {}", at.to_rfc3339());
    }
    Ok(())
}

async fn set_command(ctx: &Locations, key: &str, raw: &str) -> Result<()> {
    let (manager, _) = open_manager(ctx, Arc::new(TracingMetrics))?;
    let store = open_store(&manager).await?;
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    store.set_value(key, value)?;
    info!(key, "preference updated");
    Ok(())
}

async fn get_command(ctx: &Locations, key: &str) -> Result<()> {
    let (manager, _) = open_manager(ctx, Arc::new(TracingMetrics))?;
    let store = open_store(&manager).await?;
    match store.get_value(key) {
        Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        None => println!("(unset)"),
    }
    Ok(())
}

fn reset_hashes_command(ctx: &Locations, all: bool) -> Result<()> {
    let (manager, local_state) = open_manager(ctx, Arc::new(TracingMetrics))?;
    if all {
        StoreManager::reset_all_pref_hash_stores(&local_state);
        println!("Digests of every profile dropped");
    } else {
        manager.reset_pref_hash_store();
        println!("Digests of {} dropped", manager.profile_path().display());
    }
    Ok(())
}

async fn reset_time_command(ctx: &Locations, clear: bool) -> Result<()> {
    let (manager, _) = open_manager(ctx, Arc::new(TracingMetrics))?;
    let store = open_store(&manager).await?;
    let reset_at: Option<DateTime<Utc>> = StoreManager::get_reset_time(&*store);
    match reset_at {
        Some(at) => println!("Last reset: {}", at.to_rfc3339()),
        None => println!("No reset recorded"),
    }
    if clear && reset_at.is_some() {
        StoreManager::clear_reset_time(&store);
        println!("Reset time cleared");
    }
    Ok(())
}
