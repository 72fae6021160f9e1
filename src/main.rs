use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use device_mesh::config::file::{MeshConfigFile, config_file_path, read_config_file};
use device_mesh::config::default_snapshot_path;
use device_mesh::configurator::{ConfigSnapshot, InstanceIdentity, ServiceRegistryEntry};
use device_mesh::{
    CommandRegistry, Config, LocalHub, MemoryCoordination, Node, RpcBackPayload, RpcCallPayload,
    Transport,
};

/// Grace period between a fatal panic and process exit
const FATAL_GRACE: Duration = Duration::from_secs(3);

/// How long the local mesh waits for every instance to come online
const ONLINE_WAIT: Duration = Duration::from_secs(10);

/// Mesh node - service discovery and RPC for virtual devices
#[derive(Parser)]
#[command(name = "mesh-node", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/device-mesh/config.toml)
    #[arg(short, long, env = "MESH_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an in-process mesh and exercise calls between its instances
    Local {
        /// Number of instances to start
        #[arg(short, long, default_value = "3", value_parser = clap::value_parser!(u16).range(1..))]
        instances: u16,
        /// Service name the instances register under
        #[arg(short, long, default_value = "echo_service")]
        service: String,
        /// Number of load-balanced calls to issue
        #[arg(long, default_value = "5")]
        calls: usize,
    },
    /// Print a value from a persisted snapshot
    Show {
        /// Dotted path (e.g. "services.device_manager"); omit for the whole snapshot
        path: Option<String>,
        /// Snapshot file (defaults to the configured location)
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Validate the config file and print the effective configuration
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,device_mesh=info",
        1 => "info,device_mesh=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    install_panic_hook();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// State can't be trusted after a panic: log it, give the log a moment to
/// flush, then exit
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        tracing::error!(error_id = 200_000, panic = %info, "unrecoverable panic, exiting");
        std::thread::sleep(FATAL_GRACE);
        std::process::exit(1);
    }));
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Local {
            instances,
            service,
            calls,
        } => cmd_local(usize::from(instances), &service, calls).await,
        Command::Show { path, snapshot } => cmd_show(cli.config, path.as_deref(), snapshot),
        Command::Check => cmd_check(cli.config),
    }
}

/// Start `instances` nodes of one service on an in-process coordination store
/// and broker, then call across them
async fn cmd_local(instances: usize, service: &str, calls: usize) -> anyhow::Result<()> {
    let coordination = Arc::new(MemoryCoordination::new());
    coordination.put("/system/transport_server/host", "localhost");
    coordination.put("/system/transport_server/port", "3000");
    coordination.put("/system/transport_server/message_timeout", "5");

    let hub = LocalHub::new();
    let dir = tempfile::tempdir().context("failed to create snapshot directory")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut nodes = Vec::with_capacity(instances);
    let mut tasks = Vec::with_capacity(instances);
    for i in 0..instances {
        let mut config = Config::from_file(MeshConfigFile::default());
        config.identity.service = service.to_string();
        config.snapshot_path = dir.path().join(format!("node-{i}.json"));

        let commands = CommandRegistry::new()
            .with_fn("echo", |params| async move { RpcBackPayload::ok(params) });
        let hub = hub.clone();
        let node = Node::start(
            config,
            coordination.clone(),
            commands,
            move |identity: &InstanceIdentity| -> Arc<dyn Transport> {
                Arc::new(hub.transport(identity.uuid.clone()))
            },
        )
        .await
        .with_context(|| format!("failed to start instance {i}"))?;
        let node = Arc::new(node);

        let runner = Arc::clone(&node);
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            runner
                .run_until(async move {
                    let _ = shutdown.changed().await;
                })
                .await
        }));
        nodes.push(node);
    }

    let caller = nodes.first().context("no instances started")?;
    wait_until_online(caller, service, instances).await?;
    println!("{instances} instance(s) of {service} online");

    for seq in 0..calls {
        let reply = caller
            .device()
            .call_service(service, RpcCallPayload::new("echo", "0001", json!({ "seq": seq })))
            .await?;
        println!(
            "echo #{seq}: retCode={} data={}",
            reply.ret_code, reply.data
        );
    }

    if let Some(peer) = nodes.get(1) {
        let reply = caller
            .device()
            .call(
                peer.identity().uuid.clone(),
                RpcCallPayload::new("status", "0000", json!(["inboundTotal", "outboundTotal"])),
            )
            .await?;
        println!("peer status: {}", reply.data);
    }

    let unknown = caller
        .device()
        .call_service(service, RpcCallPayload::new("ping", "0002", json!({})))
        .await?;
    println!(
        "unknown command: retCode={} description={}",
        unknown.ret_code, unknown.description
    );

    println!(
        "caller snapshot:\n{}",
        serde_json::to_string_pretty(&caller.configurator().snapshot())?
    );

    let _ = shutdown_tx.send(true);
    for task in tasks {
        task.await??;
    }
    Ok(())
}

async fn wait_until_online(node: &Node, service: &str, expected: usize) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + ONLINE_WAIT;
    loop {
        let online = node
            .configurator()
            .service_entries(service)
            .iter()
            .filter(|e| e.is_online())
            .count();
        if online >= expected {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("only {online} of {expected} instances came online");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Print a snapshot value
fn cmd_show(
    config_path: Option<PathBuf>,
    path: Option<&str>,
    snapshot: Option<PathBuf>,
) -> anyhow::Result<()> {
    let snapshot_path = snapshot
        .or_else(|| {
            device_mesh::config::file::load_config_file(config_path.as_deref())
                .snapshot_path
                .map(PathBuf::from)
        })
        .unwrap_or_else(default_snapshot_path);
    let snapshot = ConfigSnapshot::load(&snapshot_path)
        .with_context(|| format!("failed to load {}", snapshot_path.display()))?;

    let value = match path {
        Some(path) => snapshot
            .get(path)
            .cloned()
            .with_context(|| format!("{path} is not set"))?,
        None => snapshot.to_value(),
    };

    // Service registries get a compact one-line-per-instance view
    if let Ok(entries) = serde_json::from_value::<Vec<ServiceRegistryEntry>>(value.clone()) {
        for entry in entries {
            let state = if entry.is_online() { "online" } else { "offline" };
            println!("{}  {state}", entry.uuid);
        }
        return Ok(());
    }

    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Validate the config file strictly and print the effective configuration
fn cmd_check(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.or_else(config_file_path);
    match &path {
        Some(path) if path.exists() => {
            read_config_file(path).with_context(|| format!("invalid config {}", path.display()))?;
            println!("config file: {}", path.display());
        }
        _ => println!("config file: none, using defaults"),
    }

    let config = Config::load(path.as_deref())?;
    println!("{config:#?}");
    Ok(())
}
