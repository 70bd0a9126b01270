use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use kwatch_core::{Observer, ResourceType, WatchEvent};
use kwatch_kubehub::{ConnectionConfig, KubeSource};
use kwatch_session::{EventTally, Fanout, Supervisor, SupervisorReport, WatchConfig};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kwatchctl", version, about = "Watch Kubernetes resource types and print lifecycle events")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the resource types that can be watched
    Kinds {
        /// Ask the cluster which of them it serves
        #[arg(long = "probe", action = ArgAction::SetTrue)]
        probe: bool,
        #[command(flatten)]
        conn: ConnArgs,
    },
    /// Watch resource types and print EXIST/ADD/UPDATE/DELETE events
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
struct ConnArgs {
    /// Kubeconfig file (default: in-cluster config or ~/.kube/config)
    #[arg(long = "kubeconfig", env = "KWATCH_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,
    /// Kubeconfig context to use
    #[arg(long = "context", env = "KWATCH_CONTEXT")]
    context: Option<String>,
    /// Restrict namespaced types to one namespace (default: all namespaces)
    #[arg(long = "ns", env = "KWATCH_NAMESPACE")]
    namespace: Option<String>,
    /// Label selector, e.g. "app=web"
    #[arg(long = "selector", short = 'l', env = "KWATCH_SELECTOR")]
    selector: Option<String>,
    /// Seconds to wait for the API server on connect
    #[arg(long = "connect-timeout", env = "KWATCH_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    connect_timeout_secs: u64,
}

impl ConnArgs {
    fn to_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            kubeconfig: self.kubeconfig.clone(),
            context: self.context.clone(),
            namespace: self.namespace.clone(),
            label_selector: self.selector.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
        }
    }
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Resource types to watch (repeat or comma-separate; default: all)
    #[arg(short = 't', long = "type", env = "KWATCH_TYPES", value_delimiter = ',', value_parser = parse_resource_type)]
    types: Vec<ResourceType>,
    /// Seconds to keep watching after the initial sync (0: until Ctrl-C)
    #[arg(long = "duration", env = "KWATCH_DURATION_SECS", default_value_t = 300)]
    duration_secs: u64,
    /// Seconds allowed for the initial sync (0: wait forever)
    #[arg(long = "sync-timeout", env = "KWATCH_SYNC_TIMEOUT_SECS", default_value_t = 60)]
    sync_timeout_secs: u64,
    /// Milliseconds a stopping session waits for queued events to print
    #[arg(long = "drain-grace-ms", env = "KWATCH_DRAIN_GRACE_MS", default_value_t = 2000)]
    drain_grace_ms: u64,
    /// Per-type event queue capacity
    #[arg(long = "queue-cap", env = "KWATCH_QUEUE_CAP", default_value_t = 1024)]
    queue_cap: usize,
    /// Resubscribe attempts after a live stream failure (0: fail the type)
    #[arg(long = "retries", env = "KWATCH_RETRIES", default_value_t = 0)]
    retries: u32,
    /// Upper bound for the resubscribe backoff, in seconds
    #[arg(long = "backoff-max", env = "KWATCH_BACKOFF_MAX_SECS", default_value_t = 30)]
    backoff_max_secs: u64,
    /// Stop every type as soon as one fails
    #[arg(long = "fail-fast", action = ArgAction::SetTrue)]
    fail_fast: bool,
    /// Only print the summary
    #[arg(long = "quiet", short = 'q', action = ArgAction::SetTrue)]
    quiet: bool,
    #[command(flatten)]
    conn: ConnArgs,
}

impl WatchArgs {
    fn to_config(&self) -> WatchConfig {
        let defaults = WatchConfig::default();
        let secs = |s: u64| if s == 0 { None } else { Some(Duration::from_secs(s)) };
        WatchConfig {
            resource_types: if self.types.is_empty() { ResourceType::ALL.to_vec() } else { self.types.clone() },
            run_for: secs(self.duration_secs),
            sync_timeout: secs(self.sync_timeout_secs),
            drain_grace: Duration::from_millis(self.drain_grace_ms),
            queue_capacity: self.queue_cap,
            max_resubscribes: self.retries,
            backoff_base: defaults.backoff_base.min(Duration::from_secs(self.backoff_max_secs)),
            backoff_max: Duration::from_secs(self.backoff_max_secs),
            fail_fast: self.fail_fast,
        }
    }
}

fn parse_resource_type(s: &str) -> Result<ResourceType, String> {
    ResourceType::from_str(s).map_err(|e| e.to_string())
}

fn init_tracing() {
    let env = std::env::var("KWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KWATCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KWATCH_METRICS_ADDR; expected host:port");
        }
    }
}

/// Prints one line per event.
struct Printer { output: Output }

#[derive(serde::Serialize)]
struct EventLine<'a> { resource_type: ResourceType, kind: &'static str, key: &'a str, version: &'a str }

impl Observer for Printer {
    fn on_event(&self, ev: &WatchEvent) {
        match self.output {
            Output::Human => println!("{} {} {}", ev.resource_type, ev.kind, ev.item.key),
            Output::Json => {
                let line = EventLine { resource_type: ev.resource_type, kind: ev.kind.as_str(), key: &ev.item.key, version: &ev.item.version };
                match serde_json::to_string(&line) {
                    Ok(s) => println!("{}", s),
                    Err(e) => warn!(error = %e, "failed to encode event"),
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Kinds { probe, conn } => {
            if probe {
                let source = KubeSource::connect(&conn.to_config()).await.context("connecting to cluster")?;
                let served = source.probe().await.context("probing served resources")?;
                match cli.output {
                    Output::Human => {
                        for s in served {
                            let scope = if s.namespaced { "namespaced" } else { "cluster" };
                            let state = if s.served { "served" } else { "missing" };
                            println!("{} • {} • {} • {}", s.api_version, s.resource_type, scope, state);
                        }
                    }
                    Output::Json => println!("{}", serde_json::to_string_pretty(&served)?),
                }
            } else {
                match cli.output {
                    Output::Human => {
                        for rt in ResourceType::ALL {
                            let scope = if rt.is_namespaced() { "namespaced" } else { "cluster" };
                            println!("{} • {}", rt, scope);
                        }
                    }
                    Output::Json => println!("{}", serde_json::to_string_pretty(&ResourceType::ALL)?),
                }
            }
        }
        Commands::Watch(args) => {
            let config = args.to_config();
            info!(types = ?config.resource_types, run_for = ?config.run_for, "watch invoked");
            let source = KubeSource::connect(&args.conn.to_config()).await.context("connecting to cluster")?;

            let tally = Arc::new(EventTally::new());
            let mut observer = Fanout::new().with(tally.clone());
            if !args.quiet {
                observer = observer.with(Arc::new(Printer { output: cli.output }));
            }
            let supervisor = Supervisor::new(config, Arc::new(source), Arc::new(observer)).context("invalid watch configuration")?;

            let cancel = supervisor.cancel_token();
            tokio::spawn(async move {
                if signal::ctrl_c().await.is_ok() {
                    info!("Ctrl-C received; stopping sessions");
                    cancel.cancel();
                }
            });

            let report = supervisor.run().await;
            print_summary(cli.output, &report, &tally)?;
            if !report.all_ok() {
                error!(failed = report.failed().count(), "some resource types failed");
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn print_summary(output: Output, report: &SupervisorReport, tally: &EventTally) -> Result<()> {
    match output {
        Output::Human => {
            eprintln!("{:<10} {:<7} {:>6} {:>6} {:>6} {:>6}  NOTE", "TYPE", "STATUS", "EXIST", "ADD", "UPDATE", "DELETE");
            for o in &report.outcomes {
                let c = tally.get(o.resource_type);
                let (status, note) = match &o.result {
                    Ok(r) if r.reached_synced => ("ok", format!("{:?}", r.stop_reason).to_lowercase()),
                    Ok(r) => ("ok", format!("{:?} before sync", r.stop_reason).to_lowercase()),
                    Err(e) => ("failed", e.to_string()),
                };
                eprintln!("{:<10} {:<7} {:>6} {:>6} {:>6} {:>6}  {}", o.resource_type.as_str(), status, c.exist, c.add, c.update, c.delete, note);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}
