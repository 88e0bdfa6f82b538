use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context as _, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use steve_api::{Context, NetworkBackends, Scope, SteveApi, MANAGEMENT};
use steve_core::{meta_str, EventLabel, StoreConfig};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "stevectl", version, about = "Steve store CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// API root, e.g. https://rancher.example/v1
    #[arg(long = "url", env = "STEVE_API_URL", global = true)]
    url: Option<String>,

    /// Bearer token
    #[arg(long = "token", env = "STEVE_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    /// Namespace scope
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
    /// List resources of a type
    Ls {
        /// Type, e.g. "pods" or "apps.deployment"
        ty: String,
        /// Label selector, e.g. "app=web"
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
        /// Bypass the cache
        #[arg(long = "force", action = ArgAction::SetTrue)]
        force: bool,
    },
    /// Fetch one resource (`ns/name` for namespaced types)
    Get { ty: String, id: String },
    /// Load a type, keep it watched and print applied changes
    Watch {
        ty: String,
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
    },
    /// Inspect the schema of a type
    Schema { ty: String },
    /// Print a blank instance of a type
    Defaults { ty: String },
    /// List modelfiles, optionally filtered
    Modelfiles {
        /// Case-insensitive match on id, model, model id or size
        #[arg(long = "q")]
        q: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("STEVE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter =
        tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("STEVE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid STEVE_METRICS_ADDR; expected host:port");
        }
    }
}

/// Environment config with flag overrides.
fn store_config(cli: &Cli) -> Result<StoreConfig> {
    let mut cfg = match &cli.url {
        Some(url) => {
            let mut cfg = StoreConfig::from_env().unwrap_or_else(|_| StoreConfig::new(url.clone()));
            cfg.base_url = url.clone();
            cfg
        }
        None => StoreConfig::from_env().context("no API url: pass --url or set STEVE_API_URL")?,
    };
    if cli.token.is_some() {
        cfg.token = cli.token.clone();
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let ctx = Context::new(Arc::new(NetworkBackends)).with_domain(MANAGEMENT, store_config(&cli)?);
    let t0 = Instant::now();
    let store = ctx.store(MANAGEMENT).await.context("connecting to API")?;
    info!(took_ms = %t0.elapsed().as_millis(), "store ready");

    match &cli.command {
        Commands::Ls { ty, selector, force } => {
            let scope = Scope { namespace: cli.namespace.clone(), selector: selector.clone(), force: *force };
            let items = store.list(ty, &scope).await?;
            match cli.output {
                Output::Human => {
                    let schema = store.schema(ty).await?;
                    let cols: Vec<String> =
                        schema.as_ref().map(|s| s.columns.iter().map(|c| c.name.clone()).collect()).unwrap_or_default();
                    if cols.is_empty() {
                        println!("{:<20} {:<40} {}", "NAMESPACE", "NAME", "STATE");
                        for item in items.iter() {
                            println!("{:<20} {:<40} {}", ns_col(item), name_col(item), state_col(item));
                        }
                    } else {
                        println!("{}", cols.join("\t"));
                        for item in items.iter() {
                            let row = schema.as_ref().map(|s| s.project(item)).unwrap_or_default();
                            println!("{}", row.into_iter().map(|(_, v)| v).collect::<Vec<_>>().join("\t"));
                        }
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
            }
        }
        Commands::Get { ty, id } => {
            let item = store.get(ty, id).await?;
            println!("{}", serde_json::to_string_pretty(&item)?);
        }
        Commands::Watch { ty, selector } => {
            let scope = Scope { namespace: cli.namespace.clone(), selector: selector.clone(), force: false };
            let mut stream = SteveApi::watch(&store, ty, &scope).await?;
            info!(ty = %ty, "watch invoked");
            loop {
                tokio::select! {
                    maybe = stream.rx.recv() => {
                        match maybe {
                            Some(ev) => match cli.output {
                                Output::Human => {
                                    let sign = match ev.label {
                                        EventLabel::Create => '+',
                                        EventLabel::Change => '~',
                                        EventLabel::Remove => '-',
                                    };
                                    println!("{sign} {}", ev.id);
                                }
                                Output::Json => println!("{}", serde_json::to_string(&ev)?),
                            },
                            None => {
                                warn!("event stream closed; exiting watch loop");
                                break;
                            }
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
            stream.cancel.cancel();
        }
        Commands::Schema { ty } => match store.schema(ty).await? {
            Some(schema) => match cli.output {
                Output::Human => {
                    println!("id: {}", schema.id);
                    println!("collection: {}", schema.collection_url.as_deref().unwrap_or("(none)"));
                    println!("namespaced: {}", schema.namespaced);
                    match &schema.verbs {
                        Some(vs) => println!("verbs: {}", vs.join(", ")),
                        None => println!("verbs: (unspecified)"),
                    }
                    if schema.columns.is_empty() {
                        println!("columns: (none)");
                    } else {
                        let cols: Vec<String> = schema.columns.iter().map(|c| format!("{} ({})", c.name, c.json_path)).collect();
                        println!("columns: {}", cols.join(", "));
                    }
                    let fields: Vec<&str> = schema.resource_fields.keys().map(String::as_str).collect();
                    println!("fields: {}", fields.join(", "));
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&schema)?),
            },
            None => eprintln!("no schema for {ty}"),
        },
        Commands::Defaults { ty } => {
            println!("{}", serde_json::to_string_pretty(&store.defaults(ty).await?)?);
        }
        Commands::Modelfiles { q } => {
            let items = store.modelfiles(q.as_deref()).await?;
            match cli.output {
                Output::Human => {
                    println!("{:<32} {:<32} {:<16} {}", "ID", "MODEL", "SIZE", "MODEL ID");
                    for m in items.iter() {
                        println!(
                            "{:<32} {:<32} {:<16} {}",
                            text(m, "/id"),
                            text(m, "/status/model"),
                            text(m, "/status/byteSize"),
                            text(m, "/status/modelID")
                        );
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
            }
        }
    }

    ctx.teardown();
    Ok(())
}

fn ns_col(v: &Value) -> &str {
    meta_str(v, "namespace").unwrap_or("-")
}

fn name_col(v: &Value) -> &str {
    meta_str(v, "name").or_else(|| v.get("id").and_then(|s| s.as_str())).unwrap_or("")
}

fn state_col(v: &Value) -> &str {
    meta_str(v, "state")
        .or_else(|| v.pointer("/metadata/state/name").and_then(|s| s.as_str()))
        .unwrap_or("")
}

fn text(v: &Value, ptr: &str) -> String {
    match v.pointer(ptr) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "-".to_string(),
        Some(other) => other.to_string(),
    }
}
