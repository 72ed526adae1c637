use anyhow::Context;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use vts_bridge::{
    Bridge, BridgeDeps, CommandDefinition, CommandRegistry, ConnectionState, Invocation,
    JsonFileConfigStore, StatusDisplayRegistry,
};

#[derive(Parser, Debug)]
#[command(name = "bridge_cli")]
struct Args {
    /// JSON config file. Falls back to $VTS_BRIDGE_CONFIG, then ./vts_bridge.json.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Exit after this many milliseconds instead of waiting for Ctrl-C.
    #[arg(long)]
    run_for_ms: Option<u64>,

    #[command(subcommand)]
    action: Option<Action>,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Load a model by id, then exit.
    ChangeModel { model_id: String },
    /// Trigger a hotkey of the current model by id, then exit.
    TriggerHotkey { hotkey_id: String },
}

impl Action {
    fn invocation(&self) -> Invocation {
        match self {
            Action::ChangeModel { model_id } => Invocation::ChangeModel {
                model_id: model_id.clone(),
            },
            Action::TriggerHotkey { hotkey_id } => Invocation::TriggerHotkey {
                hotkey_id: hotkey_id.clone(),
            },
        }
    }
}

/// Prints every publish to stdout as JSON lines.
#[derive(Default)]
struct PrintingRegistry;

impl CommandRegistry for PrintingRegistry {
    fn set_commands(&self, commands: Vec<CommandDefinition>) {
        match serde_json::to_string(&commands) {
            Ok(line) => println!("commands {line}"),
            Err(e) => warn!(error = %e, "cannot render commands"),
        }
    }
}

impl StatusDisplayRegistry for PrintingRegistry {
    fn set_values(&self, values: BTreeMap<String, String>) {
        match serde_json::to_string(&values) {
            Ok(line) => println!("status {line}"),
            Err(e) => warn!(error = %e, "cannot render status"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let store = match &args.config {
        Some(path) => JsonFileConfigStore::load(path.clone())
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => JsonFileConfigStore::from_env().context("failed to load config")?,
    };
    let store = Arc::new(store);
    info!(path = %store.path().display(), "config loaded");

    let registry = Arc::new(PrintingRegistry);
    let (bridge, task) = Bridge::spawn(BridgeDeps::websocket(
        store.clone(),
        registry,
        store.settings(),
    ));

    let mut transitions = bridge.on_state_change();
    tokio::spawn(async move {
        while let Ok(t) = transitions.recv().await {
            eprintln!("state: {} -> {}", t.from, t.to);
        }
    });

    bridge
        .connect_from_config()
        .await
        .context("could not connect to VTube Studio")?;

    let outcome = match &args.action {
        Some(action) => run_once(&bridge, action).await,
        None => run_until_stopped(&bridge, args.run_for_ms).await,
    };

    bridge.shutdown().await;
    let _ = task.await;
    outcome
}

async fn run_once(bridge: &Bridge, action: &Action) -> anyhow::Result<()> {
    bridge
        .execute(action.invocation())
        .await
        .with_context(|| format!("{action:?} failed"))?;
    eprintln!("ok");
    Ok(())
}

async fn run_until_stopped(bridge: &Bridge, run_for_ms: Option<u64>) -> anyhow::Result<()> {
    let deadline = async {
        match run_for_ms {
            Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = deadline => {}
        res = tokio::signal::ctrl_c() => res.context("ctrl-c handler")?,
    }
    if bridge.current_state() != ConnectionState::Connected {
        warn!(state = %bridge.current_state(), "exiting while not connected");
    }
    Ok(())
}
