//! `relaygate`: a `clap`-derived CLI wiring the HTTP proxy engine and the
//! tunnel server behind one `serve` subcommand (SPEC_FULL.md §A.3), grounded
//! on the teacher's `agentgateway-app` binary shape (clap `Args`, a
//! `tokio::runtime::Builder` entry point, config loaded from an optional
//! file) and `NomadFlowCode`'s root `clap` + subcommand CLI.

mod http_server;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use relaygate_proxy::balancer::{Algorithm, LoadBalancer};
use relaygate_proxy::resolver::ServiceResolver;
use relaygate_proxy::store::InMemoryServiceManager;
use relaygate_proxy::types::{NodeConfig, ServiceConfig};
use relaygate_proxy::{config, ProxyEngine};
use relaygate_tunnel::registry::PortRange;
use relaygate_tunnel::repository::{InMemoryServerRepository, InMemoryServiceRepository};
use relaygate_tunnel::{TunnelServer, TunnelServerConfig};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relaygate", about = "API gateway + reverse tunnel server", long_about = None)]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Run the HTTP proxy and the tunnel server together.
	Serve(ServeArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
	/// Address the downstream HTTP proxy listens on.
	#[arg(long, default_value = "0.0.0.0:8080")]
	http_addr: SocketAddr,

	/// Address the tunnel control server listens on.
	#[arg(long, default_value = "0.0.0.0:7000")]
	tunnel_addr: SocketAddr,

	/// Lowest remote port handed out to tunnel clients.
	#[arg(long, default_value_t = 10000)]
	tunnel_port_min: u16,

	/// Highest remote port handed out to tunnel clients.
	#[arg(long, default_value_t = 20000)]
	tunnel_port_max: u16,

	/// JSON file seeding `HTTPProxyConfig`, static service definitions, and
	/// tunnel client auth tokens for local/manual runs. Does not implement
	/// the admin CRUD API the spec scopes out (§1).
	#[arg(long)]
	config: Option<PathBuf>,

	/// Log format; defaults to compact text.
	#[arg(long, value_enum, default_value = "text")]
	log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
	Text,
	Json,
}

/// Seeds `HTTPProxyConfig` / static services / tunnel auth for a manual run
/// (SPEC_FULL.md §B: the admin CRUD API spec §1 scopes out still needs a
/// local stand-in for the CORE to be runnable).
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartupConfig {
	#[serde(default)]
	http_proxy: BTreeMap<String, serde_json::Value>,
	#[serde(default)]
	services: Vec<SeedService>,
	#[serde(default)]
	tunnel_auth_tokens: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeedService {
	id: String,
	name: String,
	#[serde(default)]
	metadata: BTreeMap<String, String>,
	#[serde(default)]
	nodes: Vec<SeedNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeedNode {
	id: String,
	url: String,
	#[serde(default = "default_weight")]
	weight: u32,
	#[serde(default = "default_true")]
	health: bool,
	#[serde(default = "default_true")]
	enabled: bool,
}

fn default_weight() -> u32 {
	1
}

fn default_true() -> bool {
	true
}

fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	let Command::Serve(args) = cli.command;
	init_logging(args.log_format);

	let build = relaygate_core::BuildInfo::new();
	tracing::info!(name = build.name, version = build.version, "starting up");

	tokio::runtime::Builder::new_multi_thread().enable_all().build()?.block_on(serve(args))
}

fn init_logging(format: LogFormat) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
	match format {
		LogFormat::Json => {
			subscriber.json().init();
		},
		LogFormat::Text => {
			subscriber.compact().init();
		},
	}
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
	let startup = load_startup_config(args.config.as_deref())?;

	let balancer = Arc::new(LoadBalancer::new(Algorithm::RoundRobin));
	let manager = Arc::new(InMemoryServiceManager::new(balancer));
	for svc in startup.services {
		let nodes = svc
			.nodes
			.into_iter()
			.map(|n| NodeConfig { id: n.id.into(), url: n.url, weight: n.weight, health: n.health, enabled: n.enabled, metadata: BTreeMap::new() })
			.collect();
		manager.upsert(ServiceConfig { id: svc.id.into(), name: svc.name.into(), metadata: svc.metadata }, nodes);
	}
	let resolver = Arc::new(ServiceResolver::new(None, None));
	let http_cfg = config::decode(&startup.http_proxy)?;
	let proxy_engine = Arc::new(ProxyEngine::new(manager, resolver, http_cfg));

	let tunnel_cfg = TunnelServerConfig {
		bind_addr: args.tunnel_addr,
		port_range: PortRange { min: args.tunnel_port_min, max: args.tunnel_port_max },
		auth_tokens: startup.tunnel_auth_tokens.into_iter().collect(),
		shutdown_deadline: Duration::from_secs(10),
	};
	let tunnel_server =
		TunnelServer::new(tunnel_cfg, Arc::new(InMemoryServiceRepository::default()), Arc::new(InMemoryServerRepository::default()));
	tunnel_server.start().await?;
	tracing::info!(addr = %tunnel_server.local_addr().unwrap(), "tunnel control server listening");

	let http_shutdown = CancellationToken::new();

	tokio::select! {
		res = http_server::serve(args.http_addr, proxy_engine, http_shutdown.clone()) => {
			if let Err(e) = &res {
				tracing::error!(error = %e, "http proxy exited");
			}
			tunnel_server.stop().await;
			return res;
		},
		_ = tokio::signal::ctrl_c() => {
			tracing::info!("received ctrl-c, shutting down");
		},
	}

	http_shutdown.cancel();
	tunnel_server.stop().await;
	Ok(())
}

fn load_startup_config(path: Option<&Path>) -> anyhow::Result<StartupConfig> {
	match path {
		Some(p) => {
			let text = std::fs::read_to_string(p)?;
			Ok(serde_json::from_str(&text)?)
		},
		None => Ok(StartupConfig::default()),
	}
}
