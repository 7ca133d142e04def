use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kdns_core::{parse_service_key, service_key, Delta, DeltaKind, Service, ServiceProjector, WorldSnapshot};
use kdns_store::spawn_ingest;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const DEFAULT_NAMESPACE: &str = "default";

#[derive(Parser, Debug)]
#[command(name = "kdnsctl", version, about = "Inspect the reduced Service cache that backs cluster DNS")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", env = "KDNS_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// Capacity of the delta channel and coalescing queue
    #[arg(long = "queue-cap", env = "KDNS_QUEUE_CAP", global = true, default_value_t = 2048)]
    queue_cap: usize,

    /// Seconds to wait for the first snapshot
    #[arg(long = "wait-secs", env = "KDNS_WAIT_SECS", global = true, default_value_t = 8)]
    wait_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List cached services
    Ls,
    /// Show one service by name or namespace/name
    Get {
        /// "name" (namespace from --ns, else "default") or "namespace/name"
        name: String,
    },
    /// Watch services and print +/- events
    Watch,
}

fn init_tracing() {
    let env = std::env::var("KDNS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KDNS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KDNS_METRICS_ADDR; expected host:port");
        }
    }
}

/// Resolve a `get` argument into `(namespace, key)`.
fn resolve_key(arg: &str, namespace: Option<&str>) -> Result<(String, String)> {
    if arg.contains('/') {
        let (ns, name) = parse_service_key(arg)?;
        Ok((ns.to_string(), service_key(ns, name)))
    } else {
        let ns = namespace.unwrap_or(DEFAULT_NAMESPACE);
        Ok((ns.to_string(), service_key(ns, arg)))
    }
}

fn lookup<'a>(snap: &'a WorldSnapshot<Service>, key: &str) -> Result<&'a Service> {
    match snap.get(key) {
        Some(svc) => Ok(svc),
        None => anyhow::bail!("service {} not found", key),
    }
}

fn render_ports(svc: &Service) -> String {
    if svc.ports.iter().all(|p| p.is_sentinel()) {
        return "<none>".to_string();
    }
    svc.ports
        .iter()
        .map(|p| format!("{}/{}", p.port, p.protocol.as_deref().unwrap_or("TCP")))
        .collect::<Vec<_>>()
        .join(",")
}

fn or_dash(s: &str) -> &str {
    if s.is_empty() { "-" } else { s }
}

fn print_table<'a>(items: impl Iterator<Item = &'a Service>) {
    println!("{:<16} {:<24} {:<13} {:<16} {:<20} PORTS", "NAMESPACE", "NAME", "TYPE", "CLUSTER-IP", "EXTERNAL-NAME");
    for s in items {
        println!(
            "{:<16} {:<24} {:<13} {:<16} {:<20} {}",
            s.namespace,
            s.name,
            s.type_,
            or_dash(&s.cluster_ip),
            or_dash(&s.external_name),
            render_ports(s)
        );
    }
}

/// Fill a cache from one list plus a short-lived watch and return the first
/// snapshot that holds every listed service.
async fn load_snapshot(namespace: Option<&str>, cap: usize, wait_secs: u64) -> Result<Arc<WorldSnapshot<Service>>> {
    let (ingest_tx, backend) = spawn_ingest::<Service>(cap);
    let watcher_handle = tokio::spawn({
        let ns = namespace.map(|s| s.to_string());
        let tx = ingest_tx.clone();
        async move {
            if let Err(e) = kdns_kubehub::start_watcher(ServiceProjector, ns.as_deref(), tx).await {
                error!(error = ?e, "watcher failed");
            }
        }
    });

    let primed = kdns_kubehub::prime_list(&ServiceProjector, namespace, &ingest_tx)
        .await
        .context("listing services")?;

    // Coalescing may split the primed list over several epochs; wait for all of it.
    let snap = backend
        .wait_until(Duration::from_secs(wait_secs), |s| primed.iter().all(|k| s.get(k).is_some()))
        .await;
    if snap.len() < primed.len() {
        warn!(primed = primed.len(), cached = snap.len(), "snapshot incomplete after wait");
    }

    drop(ingest_tx);
    watcher_handle.abort();
    Ok(snap)
}

async fn watch(namespace: Option<&str>, cap: usize, output: Output) -> Result<()> {
    let (tap_tx, mut tap_rx) = mpsc::channel::<Delta<Service>>(cap.max(1));

    let watcher_handle = tokio::spawn({
        let ns = namespace.map(|s| s.to_string());
        async move {
            if let Err(e) = kdns_kubehub::start_watcher(ServiceProjector, ns.as_deref(), tap_tx).await {
                error!(error = ?e, "watcher failed");
            }
        }
    });

    let mut seen_rv: HashMap<String, String> = HashMap::new();
    loop {
        tokio::select! {
            maybe = tap_rx.recv() => {
                let Some(d) = maybe else {
                    warn!("tap channel closed; exiting watch loop");
                    break;
                };
                match (d.kind, d.obj.as_ref()) {
                    (DeltaKind::Applied, Some(svc)) => {
                        if seen_rv.get(&d.key).map(|rv| rv == &svc.version).unwrap_or(false) {
                            continue;
                        }
                        seen_rv.insert(d.key.clone(), svc.version.clone());
                        match output {
                            Output::Human => println!("+ {} {} {}", d.key, or_dash(&svc.cluster_ip), render_ports(svc)),
                            Output::Json => println!("{}", serde_json::to_string(&d)?),
                        }
                    }
                    (DeltaKind::Applied, None) => {}
                    (DeltaKind::Deleted, _) => {
                        seen_rv.remove(&d.key);
                        match output {
                            Output::Human => println!("- {}", d.key),
                            Output::Json => println!("{}", serde_json::to_string(&d)?),
                        }
                    }
                }
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down watch loop");
                break;
            }
        }
    }

    watcher_handle.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Ls => {
            let ns = cli.namespace.as_deref();
            info!(ns = ?ns, "ls invoked");
            let snap = load_snapshot(ns, cli.queue_cap, cli.wait_secs).await?;
            match cli.output {
                Output::Human => print_table(snap.items.values()),
                Output::Json => {
                    let items: Vec<&Service> = snap.items.values().collect();
                    println!("{}", serde_json::to_string_pretty(&items)?);
                }
            }
        }
        Commands::Get { name } => {
            let (ns, key) = resolve_key(&name, cli.namespace.as_deref())?;
            info!(key = %key, "get invoked");
            let snap = load_snapshot(Some(&ns), cli.queue_cap, cli.wait_secs).await?;
            let svc = lookup(&snap, &key)?;
            match cli.output {
                Output::Human => print_table(std::iter::once(svc)),
                Output::Json => println!("{}", serde_json::to_string_pretty(svc)?),
            }
        }
        Commands::Watch => {
            let ns = cli.namespace.as_deref();
            info!(ns = ?ns, "watch invoked");
            watch(ns, cli.queue_cap, cli.output).await?;
            warn!("watch loop ended (graceful shutdown)");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdns_core::{ServicePort, ServiceType};

    fn svc(ports: Vec<ServicePort>) -> Service {
        Service {
            version: "1".into(),
            name: "web".into(),
            namespace: "default".into(),
            index: service_key("default", "web"),
            cluster_ip: "10.0.0.5".into(),
            type_: ServiceType::ClusterIP,
            external_name: String::new(),
            ports: ports.into_iter().collect(),
        }
    }

    #[test]
    fn resolve_key_variants() {
        assert_eq!(resolve_key("web", None).unwrap(), ("default".to_string(), "default/web".to_string()));
        assert_eq!(resolve_key("web", Some("prod")).unwrap(), ("prod".to_string(), "prod/web".to_string()));
        assert_eq!(resolve_key("kube-system/dns", Some("prod")).unwrap(), ("kube-system".to_string(), "kube-system/dns".to_string()));
        assert!(resolve_key("a/b/c", None).is_err());
    }

    #[test]
    fn get_of_missing_service_is_an_error() {
        let mut snap = WorldSnapshot::<Service>::default();
        snap.items.insert("default/web".into(), svc(vec![ServicePort::sentinel()]));
        assert_eq!(lookup(&snap, "default/web").unwrap().name, "web");
        let err = lookup(&snap, "default/db").unwrap_err();
        assert_eq!(err.to_string(), "service default/db not found");
    }

    #[test]
    fn ports_render() {
        let p = |n: i32, proto: Option<&str>| ServicePort { name: None, protocol: proto.map(|s| s.to_string()), port: n, target_port: None };
        assert_eq!(render_ports(&svc(vec![p(80, Some("TCP")), p(53, Some("UDP"))])), "80/TCP,53/UDP");
        assert_eq!(render_ports(&svc(vec![p(8080, None)])), "8080/TCP");
        assert_eq!(render_ports(&svc(vec![ServicePort::sentinel()])), "<none>");
    }
}
