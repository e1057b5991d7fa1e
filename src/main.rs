//! edge-agent: service registration and policy synthesis for edge nodes
//!
//! `edge-agent run` starts the daemon, which registers the services pinned by
//! the node's pattern and keeps archived registrations tidy. The other
//! subcommands operate on the local store directly and print JSON.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use edge_agent::catalog::ExchangeClient;
use edge_agent::eventlog::{EventLogQuery, Severity, StoreAuditSink};
use edge_agent::events::{Event, EventBus};
use edge_agent::persistence::{
    ConfigState, Device, PersistenceStore, ServiceDefFilter, SqliteStore,
};
use edge_agent::policy::PolicyWriter;
use edge_agent::registrar::RegistrarSettings;
use edge_agent::resource::ResourceWorker;
use edge_agent::worker::WorkerCore;
use edge_agent::{Config, ServiceRegistrar, ServiceRequest};

#[derive(Parser)]
#[command(name = "edge-agent")]
#[command(about = "Edge node agent: service registration and policy synthesis")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "edge-agent.toml")]
    config: PathBuf,

    /// Data directory (overrides config file)
    #[arg(short, long, env = "EDGE_AGENT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Exchange API URL (overrides config file)
    #[arg(long, env = "EDGE_AGENT_EXCHANGE_URL")]
    exchange_url: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent daemon (default)
    Run,
    /// Manage the node's exchange registration
    #[command(subcommand)]
    Device(DeviceCommand),
    /// Manage registered services
    #[command(subcommand)]
    Service(ServiceCommand),
    /// Inspect the audit event log
    #[command(subcommand)]
    Eventlog(EventlogCommand),
}

#[derive(Subcommand)]
enum DeviceCommand {
    /// Record the node's exchange registration
    Set {
        #[arg(long)]
        org: String,
        #[arg(long)]
        id: String,
        #[arg(long, env = "EDGE_AGENT_NODE_TOKEN")]
        token: String,
        /// Deployment pattern, `org/name` or `name`
        #[arg(long, default_value = "")]
        pattern: String,
        #[arg(long)]
        ha: bool,
    },
    Show,
    /// Archive every service and forget the registration
    Unset,
}

#[derive(Subcommand)]
enum ServiceCommand {
    /// Register a service from a JSON request file, `-` for stdin
    Register { file: String },
    /// Registered services with their attributes
    List,
    /// Cached service definitions
    Registered {
        /// Include archived definitions
        #[arg(long)]
        all: bool,
    },
    /// Archive registrations; all of them when no filter is given
    Remove(ServiceSelection),
    /// Suspend registrations; all of them when no filter is given
    Suspend(ServiceSelection),
    /// Resume suspended registrations; all of them when no filter is given
    Resume(ServiceSelection),
    /// Config state of each registered service
    Configstate,
}

#[derive(clap::Args)]
struct ServiceSelection {
    #[arg(long)]
    org: Option<String>,
    #[arg(long, requires = "org")]
    url: Option<String>,
}

#[derive(Subcommand)]
enum EventlogCommand {
    List {
        /// info, warning or error
        #[arg(long, value_parser = parse_severity)]
        severity: Option<Severity>,
        #[arg(long)]
        code: Option<String>,
        #[arg(long)]
        service_url: Option<String>,
        /// Words that must all appear in the message
        #[arg(long)]
        contains: Vec<String>,
        /// Only entries at or after this unix time
        #[arg(long)]
        since: Option<u64>,
    },
}

fn parse_severity(raw: &str) -> Result<Severity, String> {
    serde_json::from_value(serde_json::Value::String(raw.to_lowercase()))
        .map_err(|_| format!("unknown severity {}", raw))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("edge_agent=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    // Apply CLI overrides
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = data_dir;
    }
    if let Some(url) = cli.exchange_url {
        config.exchange.url = url;
    }

    let store = Arc::new(SqliteStore::open(&config.database_path())?);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(config, store).await,
        Command::Device(cmd) => device_command(&config, store, cmd),
        Command::Service(cmd) => service_command(&config, store, cmd).await,
        Command::Eventlog(EventlogCommand::List {
            severity,
            code,
            service_url,
            contains,
            since,
        }) => {
            let logs = store.find_event_logs(&EventLogQuery {
                severity,
                event_code: code,
                message_contains: contains,
                service_url,
                since,
            })?;
            print_json(&logs)
        }
    }
}

fn build_registrar(config: &Config, store: Arc<SqliteStore>) -> anyhow::Result<ServiceRegistrar> {
    let mut exchange = ExchangeClient::new(config.exchange.url.clone(), config.request_timeout());
    if let Some(device) = store.find_device()? {
        exchange = exchange.with_node_credentials(&device.org, &device.id, &device.token);
    }

    Ok(ServiceRegistrar::new(
        store.clone(),
        Arc::new(exchange),
        Arc::new(StoreAuditSink::new(store)),
        PolicyWriter::new(config.policy_dir()),
        RegistrarSettings::from_config(config),
    ))
}

async fn run_daemon(config: Config, store: Arc<SqliteStore>) -> anyhow::Result<()> {
    info!(
        data_dir = %config.node.data_dir.display(),
        exchange = %config.exchange.url,
        "Starting edge-agent"
    );

    let bus = EventBus::default();
    let registrar = Arc::new(build_registrar(&config, store.clone())?);
    let resource = ResourceWorker::new(registrar, bus.clone(), config.gc_retention());
    let handle = WorkerCore::new(resource, Some(config.resource_idle_timeout()))
        .subscribe(&bus)
        .start();

    match store.find_device()? {
        Some(device) => {
            bus.publish(Event::NodeConfigured {
                org: device.org,
                device_id: device.id,
                pattern: device.pattern,
            });
        }
        None => info!("No device registration recorded, waiting for shutdown"),
    }

    let queue = handle.queue();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            queue.terminate("shutdown signal");
        }
    });

    handle.join().await?;
    info!("edge-agent stopped");
    Ok(())
}

fn device_command(
    config: &Config,
    store: Arc<SqliteStore>,
    cmd: DeviceCommand,
) -> anyhow::Result<()> {
    match cmd {
        DeviceCommand::Set {
            org,
            id,
            token,
            pattern,
            ha,
        } => {
            let device = Device {
                org,
                id,
                token,
                pattern,
                ha_enabled: ha,
            };
            store.save_device(&device)?;
            info!(org = %device.org, id = %device.id, "Device registration recorded");
            Ok(())
        }
        DeviceCommand::Show => match store.find_device()? {
            Some(device) => print_json(&device),
            None => anyhow::bail!("no device registration recorded"),
        },
        DeviceCommand::Unset => {
            let registrar = build_registrar(config, store.clone())?;
            let archived = registrar.unregister(None, None)?;
            store.delete_device()?;
            info!(services = archived.len(), "Device registration removed");
            Ok(())
        }
    }
}

async fn service_command(
    config: &Config,
    store: Arc<SqliteStore>,
    cmd: ServiceCommand,
) -> anyhow::Result<()> {
    match cmd {
        ServiceCommand::Register { file } => {
            let raw = if file == "-" {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                std::fs::read_to_string(&file).with_context(|| format!("reading {}", file))?
            };
            let request: ServiceRequest =
                serde_json::from_str(&raw).context("parsing service request")?;

            let registrar = build_registrar(config, store)?;
            let doc = registrar.register(request, true).await?;
            print_json(&doc)
        }
        ServiceCommand::List => {
            let registrar = build_registrar(config, store)?;
            print_json(&registrar.service_configs()?)
        }
        ServiceCommand::Registered { all } => {
            let filters = if all {
                vec![]
            } else {
                vec![ServiceDefFilter::Unarchived]
            };
            print_json(&store.find_service_defs(&filters)?)
        }
        ServiceCommand::Remove(selection) => {
            let registrar = build_registrar(config, store)?;
            let archived =
                registrar.unregister(selection.org.as_deref(), selection.url.as_deref())?;
            print_json(&archived)
        }
        ServiceCommand::Suspend(selection) => {
            set_config_state(config, store, selection, ConfigState::Suspended)
        }
        ServiceCommand::Resume(selection) => {
            set_config_state(config, store, selection, ConfigState::Active)
        }
        ServiceCommand::Configstate => {
            let registrar = build_registrar(config, store)?;
            print_json(&registrar.config_states()?)
        }
    }
}

fn set_config_state(
    config: &Config,
    store: Arc<SqliteStore>,
    selection: ServiceSelection,
    state: ConfigState,
) -> anyhow::Result<()> {
    let registrar = build_registrar(config, store)?;
    let changed = registrar.set_config_state(
        selection.org.as_deref(),
        selection.url.as_deref(),
        state,
    )?;
    info!(services = changed.len(), state = %state, "Config state updated");
    print_json(&changed)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
