use agentmesh::{
    config::Config,
    constants::*,
    network::{TcpPresence, TcpPresenceConfig},
    runtime::AgentEvent,
    Agent,
};
use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(author, version, about = "agentmesh agent (TCP presence)")]
struct Args {
    /// Optional path to config file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Agent name (overrides [agent] name)
    #[arg(short, long)]
    name: Option<String>,

    /// Definition JSON to load at startup
    #[arg(short, long)]
    definition: Option<String>,

    /// Mapping JSON to load at startup
    #[arg(short, long)]
    mapping: Option<String>,

    /// Presence port (overrides [network] presence_port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Extra presence peers to dial (host:port), repeatable
    #[arg(short, long)]
    bootstrap: Vec<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| "config.toml".to_string());
    let config = match Config::load_or_default(&config_path) {
        Ok((cfg, true)) => {
            println!("{}Loaded config from: {}", ICON_PLACEHOLDER, config_path);
            cfg
        }
        Ok((cfg, false)) => {
            println!(
                "⚠️ No config file found at '{}', falling back to default config.",
                config_path
            );
            cfg
        }
        Err(err) => {
            eprintln!("❌ {}", err);
            std::process::exit(1);
        }
    };

    // Initialize events AFTER config is loaded so custom logging path can be applied
    agentmesh::events::init_events_from_config(config.logging.as_ref()).await;
    agentmesh::emit_system_event!(
        "main",
        agentmesh::events::LogLevel::Info,
        "startup",
        full_version()
    );

    let mut presence_config = TcpPresenceConfig::from_config(&config);
    if let Some(port) = args.port {
        presence_config.port = port;
    }
    presence_config
        .bootstrap_nodes
        .extend(args.bootstrap.iter().cloned());

    let name = args.name.clone().unwrap_or_else(|| config.agent_name());
    let definition_path = args
        .definition
        .clone()
        .or_else(|| config.agent.as_ref().and_then(|a| a.definition_path.clone()));
    let mapping_path = args
        .mapping
        .clone()
        .or_else(|| config.agent.as_ref().and_then(|a| a.mapping_path.clone()));

    let mut agent = Agent::new(&name, config, Box::new(TcpPresence::new(presence_config)));
    if let Some(path) = definition_path {
        if let Err(e) = agent.load_definition_file(&path) {
            eprintln!("❌ Failed to load definition '{}': {}", path, e);
            std::process::exit(1);
        }
    }
    if let Some(path) = mapping_path {
        if let Err(e) = agent.load_mapping_file(&path) {
            eprintln!("❌ Failed to load mapping '{}': {}", path, e);
            std::process::exit(1);
        }
    }

    let mut events = agent.subscribe_events();
    // Agent start/stop block on the reactor thread handshake.
    let agent = match tokio::task::spawn_blocking(move || agent.start().map(|_| agent)).await {
        Ok(Ok(agent)) => agent,
        Ok(Err(e)) => {
            eprintln!("❌ Failed to start agent '{}': {}", name, e);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("❌ Startup task failed: {}", e);
            std::process::exit(1);
        }
    };
    println!(
        "🟢 {} is running ({}). Press Ctrl+C to shut down...",
        name,
        agent.node_id()
    );

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(AgentEvent::InputUpdated { name, value }) => {
                    println!("{}input {} = {}", ICON_PLACEHOLDER, name, value);
                }
                Ok(AgentEvent::PeerEntered { name, .. }) => {
                    println!("{}peer entered: {}", ICON_PLACEHOLDER, name);
                }
                Ok(AgentEvent::PeerExited { name, .. }) => {
                    println!("{}peer exited: {}", ICON_PLACEHOLDER, name);
                }
                Ok(AgentEvent::ForcedStop { by }) => {
                    println!("🛑 Stopped by peer {}", by);
                    break;
                }
                Ok(AgentEvent::Stopped) | Err(RecvError::Closed) => break,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
            },
        }
    }

    println!("🛑 {} shutting down gracefully.", name);
    let _ = tokio::task::spawn_blocking(move || {
        let mut agent = agent;
        agent.stop();
    })
    .await;
}
