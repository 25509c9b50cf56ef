use clap::Parser;
use pkg_constants::presence::presence_doc_path;
use pkg_presence::{
    AuthBinding, ManualAuth, MemoryDocumentStore, PresenceOrchestrator, TracingErrorSink,
};
use pkg_signals::{Network, Platform, PlatformBridge, PlatformEvent, Visibility};
use pkg_state::{MemorySharedStore, SystemClock};
use pkg_types::config::{PresenceConfig, PresenceConfigFile, load_config_file};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(
    name = "presence-sim",
    about = "Run several presence agents for one identity against in-memory stores"
)]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = "presence.yaml")]
    config: String,

    /// Number of agents signed in as the identity
    #[arg(long, default_value = "3")]
    agents: usize,

    /// Identity every agent signs in as
    #[arg(long, default_value = "demo-user")]
    identity: String,

    /// Total scenario length
    #[arg(long, default_value = "40")]
    duration_secs: u64,

    /// Write `offline` when an agent exits (overrides the config file)
    #[arg(long)]
    mark_offline_on_exit: Option<bool>,
}

struct SimAgent {
    label: String,
    orchestrator: Arc<PresenceOrchestrator>,
    platform: PlatformBridge,
    _binding: AuthBinding,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "presence_sim=info,pkg_presence=info,pkg_state=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    let cli = Cli::parse();

    // Load config file (returns defaults if file not found)
    let file_cfg: PresenceConfigFile = load_config_file(&cli.config)?;
    info!("Config file: {}", cli.config);

    // Merge: CLI args > config file > defaults
    let mut config = PresenceConfig::from_file(&file_cfg);
    if let Some(flag) = cli.mark_offline_on_exit {
        config.mark_offline_on_exit = flag;
    }
    if cli.agents == 0 {
        anyhow::bail!("--agents must be at least 1");
    }

    info!("Starting presence-sim");
    info!("  Identity:  {}", cli.identity);
    info!("  Agents:    {}", cli.agents);
    info!("  Lease TTL: {}s", config.lease_ttl.as_secs());
    info!("  Heartbeat: {}s", config.heartbeat_interval.as_secs());
    info!("  Offline on exit: {}", config.mark_offline_on_exit);

    let store = MemorySharedStore::new();
    let clock = Arc::new(SystemClock);
    let docs = Arc::new(MemoryDocumentStore::new(clock.clone()));
    let sink = Arc::new(TracingErrorSink);
    let auth = ManualAuth::new();

    let agents: Vec<SimAgent> = (0..cli.agents)
        .map(|i| {
            let label = format!("agent-{}", i);
            let (platform, bridge) = Platform::channel(Visibility::Visible, Network::Online);
            let orchestrator = Arc::new(PresenceOrchestrator::assemble(
                config.clone(),
                Arc::new(store.agent(&label)),
                docs.clone(),
                clock.clone(),
                Some(platform),
                sink.clone(),
            ));
            let binding = orchestrator.bind(&auth);
            SimAgent {
                label,
                orchestrator,
                platform: bridge,
                _binding: binding,
            }
        })
        .collect();

    auth.mark_ready();
    auth.sign_in(&cli.identity);

    tokio::select! {
        _ = run_scenario(&agents, Duration::from_secs(cli.duration_secs)) => {
            info!("Scenario finished");
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupted, tearing agents down");
            for agent in &agents {
                agent.platform.emit(PlatformEvent::BeforeUnload);
            }
            // Give exit hooks a moment to hand off.
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    for agent in &agents {
        agent.orchestrator.stop().await;
    }

    let path = presence_doc_path(&cli.identity);
    match docs.get(&path).await {
        Some(doc) => println!("{}", serde_json::to_string_pretty(&doc)?),
        None => warn!("No presence document was written at {}", path),
    }

    Ok(())
}

/// Leader hides, leader exits, a follower takes over.
async fn run_scenario(agents: &[SimAgent], duration: Duration) {
    let step = duration / 4;
    tokio::time::sleep(step).await;

    let Some(leader) = find_leader(agents).await else {
        warn!("No agent is leading after {}s", step.as_secs());
        return;
    };
    info!("{} ({}) goes hidden", leader.label, leader.orchestrator.agent_id());
    leader
        .platform
        .emit(PlatformEvent::VisibilityChange { hidden: true });
    tokio::time::sleep(step).await;

    info!("{} exits", leader.label);
    leader.platform.emit(PlatformEvent::BeforeUnload);
    leader.orchestrator.stop().await;
    tokio::time::sleep(step).await;

    match find_leader(agents).await {
        Some(next) => info!("{} took over presence", next.label),
        None => warn!("No agent took over presence"),
    }
    tokio::time::sleep(step).await;
}

async fn find_leader(agents: &[SimAgent]) -> Option<&SimAgent> {
    for agent in agents {
        if let Some(state) = agent.orchestrator.session_state().await {
            if state.borrow().is_leading() {
                return Some(agent);
            }
        }
    }
    None
}
