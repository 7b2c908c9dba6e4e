use anyhow::Context;
use chanrelay::cli::{self, Args};
use chanrelay::config::ConfigStore;
use chanrelay::control::PauseController;
use chanrelay::engine::RelayEngine;
use chanrelay::mapping::MappingStore;
use chanrelay::session::SessionRegistry;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = ConfigStore::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if args.validate {
        let snapshot = config.current();
        println!(
            "{}: {} pair(s), {} session(s)",
            args.config.display(),
            snapshot.pair_ids().len(),
            snapshot.sessions.len()
        );
        return Ok(());
    }

    let data_dir = args.data_dir.clone().unwrap_or_else(cli::default_data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;

    let limits = config.current().limits;
    let mappings = Arc::new(MappingStore::open(data_dir.join("mappings.json"))?);
    let pauses = Arc::new(PauseController::open(
        Duration::from_secs(limits.auto_resume_secs),
        data_dir.join("pauses.json"),
    )?);

    let client = delivery_client()?;
    let engine = RelayEngine::new(Arc::clone(&config), client, mappings, pauses);

    let (events_tx, events_rx) = mpsc::channel(256);
    let registry = Arc::new(SessionRegistry::new(Arc::clone(&config), events_tx));
    spawn_sessions(&registry, &config)?;

    let engine_task = tokio::spawn(Arc::clone(&engine).run(events_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    for session in &config.current().sessions {
        registry.stop(&session.id);
    }
    drop(registry);
    engine_task.await?;
    Ok(())
}

#[cfg(feature = "telegram")]
fn delivery_client() -> anyhow::Result<Arc<dyn chanrelay::router::DeliveryClient>> {
    Ok(Arc::new(chanrelay::telegram::TelegramDelivery::new()))
}

#[cfg(not(feature = "telegram"))]
fn delivery_client() -> anyhow::Result<Arc<dyn chanrelay::router::DeliveryClient>> {
    anyhow::bail!("built without a channel integration; rebuild with --features telegram")
}

/// Start one listener actor per configured session. A session listens
/// with the credential of its owner's first pair.
#[cfg(feature = "telegram")]
fn spawn_sessions(registry: &Arc<SessionRegistry>, config: &Arc<ConfigStore>) -> anyhow::Result<()> {
    use chanrelay::telegram::TelegramListener;

    let snapshot = config.current();
    for session in &snapshot.sessions {
        let token = snapshot
            .pair_ids()
            .iter()
            .filter_map(|id| snapshot.pair(id))
            .find(|p| p.owner == session.owner)
            .and_then(|p| snapshot.credential(&p.credential).cloned());
        let Some(token) = token else {
            tracing::warn!(session = %session.id, "no pair credential for owner, session not started");
            continue;
        };
        registry.spawn(&session.id, Arc::new(TelegramListener::new(token)))?;
    }
    Ok(())
}

#[cfg(not(feature = "telegram"))]
fn spawn_sessions(
    _registry: &Arc<SessionRegistry>,
    _config: &Arc<ConfigStore>,
) -> anyhow::Result<()> {
    Ok(())
}
