use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use svcbind_api::ServiceSelector;
use svcbind_context::build_service_contexts;
use svcbind_kube::{KubeCluster, KubeWatchSink};
use svcbind_watch::{map_csv_event, CsvEvent, WatchRegistry};
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "svcbindctl", version, about = "svcbind service-binding CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: "default")
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build service contexts for the given selectors
    Resolve {
        /// Selectors, e.g. "postgres.dev/v1alpha1/Database:db1" or
        /// "v1/Secret:creds@mydb" (trailing @id optional)
        selectors: Vec<String>,
        /// YAML file with a selector list (merged after positional ones)
        #[arg(long = "file")]
        file: Option<std::path::PathBuf>,
        /// Name template used to derive final variable keys
        #[arg(long = "naming-template", default_value = "{{ .name }}")]
        naming_template: String,
        /// Project bindings as files instead of env vars
        #[arg(long = "bind-as-files", action = ArgAction::SetTrue)]
        bind_as_files: bool,
        /// Also bind resources owned by each selected service
        #[arg(long = "include-owned", action = ArgAction::SetTrue)]
        include_owned: bool,
    },
    /// Register watches for the kinds a CSV declares, then stream deltas
    WatchKinds {
        /// CSV namespace
        namespace: String,
        /// CSV name, e.g. "pg-operator.v1.2.0"
        name: String,
    },
}

fn init_tracing() {
    let env = std::env::var("SVCBIND_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SVCBIND_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid SVCBIND_METRICS_ADDR; expected host:port");
        }
    }
}

/// Parse "group/version/Kind:name[@id]" (group optional for core kinds).
fn parse_selector(s: &str) -> Result<ServiceSelector> {
    let (gvk, rest) = s
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("selector {:?} missing ':name'", s))?;
    let (name, id) = match rest.split_once('@') {
        Some((n, i)) => (n, Some(i.to_string())),
        None => (rest, None),
    };
    if name.is_empty() {
        return Err(anyhow!("selector {:?} has an empty name", s));
    }
    let parts: Vec<&str> = gvk.split('/').collect();
    let (group, version, kind) = match parts.as_slice() {
        [version, kind] => (String::new(), (*version).to_string(), (*kind).to_string()),
        [group, version, kind] => (
            (*group).to_string(),
            (*version).to_string(),
            (*kind).to_string(),
        ),
        _ => return Err(anyhow!("selector {:?}: expect [group/]version/Kind:name", s)),
    };
    Ok(ServiceSelector {
        group,
        version,
        kind,
        name: name.to_string(),
        namespace: None,
        id,
    })
}

fn selectors_from_file(path: &std::path::Path) -> Result<Vec<ServiceSelector>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let sels: Vec<ServiceSelector> =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(sels)
}

fn render_value(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let default_ns = cli.namespace.clone().unwrap_or_else(|| "default".to_string());

    match cli.command {
        Commands::Resolve {
            selectors,
            file,
            naming_template,
            bind_as_files,
            include_owned,
        } => {
            let mut sels = selectors
                .iter()
                .map(|s| parse_selector(s))
                .collect::<Result<Vec<_>>>()?;
            if let Some(path) = file {
                sels.extend(selectors_from_file(&path)?);
            }
            if sels.is_empty() {
                return Err(anyhow!("no selectors given (positional or --file)"));
            }
            info!(count = sels.len(), ns = %default_ns, "resolve invoked");

            let ops = KubeCluster::new();
            let ctxs = build_service_contexts(
                &ops,
                &default_ns,
                &sels,
                include_owned,
                bind_as_files,
                &naming_template,
            )
            .await
            .map_err(|e| anyhow!("building service contexts: {e}"))?;

            match cli.output {
                Output::Human => {
                    for ctx in ctxs.iter() {
                        let kind = ctx
                            .service
                            .get("kind")
                            .and_then(|k| k.as_str())
                            .unwrap_or("?");
                        let name = ctx
                            .service
                            .get("metadata")
                            .and_then(|m| m.get("name"))
                            .and_then(|n| n.as_str())
                            .unwrap_or("?");
                        let id = ctx.id.as_deref().unwrap_or("-");
                        println!("{} {} (id: {})", kind, name, id);
                        for (k, v) in &ctx.env_vars {
                            println!("  {} = {}", k, render_value(v));
                        }
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&ctxs)?),
            }
        }
        Commands::WatchKinds { namespace, name } => {
            info!(csv = %name, ns = %namespace, "watch-kinds invoked");
            let cap = std::env::var("SVCBIND_QUEUE_CAP")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(2048);
            let (tx, mut rx) = mpsc::channel::<svcbind_core::Delta>(cap);

            let ops = KubeCluster::new();
            let registry = WatchRegistry::new();
            let sink = KubeWatchSink::new(Some(namespace.clone()), tx);
            let event = CsvEvent {
                namespace,
                name,
            };
            let requests = map_csv_event(&ops, &registry, &sink, &event).await;
            debug_assert!(requests.is_empty());

            let keys = registry.keys();
            if keys.is_empty() {
                error!("no kinds registered; nothing to stream");
                return Ok(());
            }
            match cli.output {
                Output::Human => {
                    for key in &keys {
                        println!("watching {}", key);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&keys)?),
            }

            loop {
                tokio::select! {
                    maybe = rx.recv() => {
                        match maybe {
                            Some(d) => {
                                let sign = match d.kind {
                                    svcbind_core::DeltaKind::Applied => '+',
                                    svcbind_core::DeltaKind::Deleted => '-',
                                };
                                let kind = d.raw.get("kind").and_then(|k| k.as_str()).unwrap_or("?");
                                let name = d.raw.get("metadata").and_then(|m| m.get("name")).and_then(|n| n.as_str()).unwrap_or("?");
                                match cli.output {
                                    Output::Human => println!("{} {} {}", sign, kind, name),
                                    Output::Json => println!("{}", serde_json::to_string(&d)?),
                                }
                            }
                            None => break,
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("interrupted; shutting down");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
