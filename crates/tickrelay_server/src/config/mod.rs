#![forbid(unsafe_code)]

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::relay::RelaySettings;

/// Default config path: `~/.tickrelay/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".tickrelay").join("config.toml"))
}

/// Load the server config from TOML at `path`, then apply env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);
	cfg.relay.sanitize();

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub relay: RelaySettings,
	pub server: ServerSettings,
}

/// Settings outside the relay itself.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	relay: FileRelaySettings,

	#[serde(default)]
	server: FileServerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRelaySettings {
	bind_ip: Option<String>,
	port: Option<u16>,
	max_clients: Option<usize>,
	client_pool: Option<u32>,
	client_pool_recovery_per_sec: Option<f64>,
	usage_pool: Option<u64>,
	usage_pool_recovery_per_sec: Option<u64>,
	header_adj: Option<u32>,
	proc_adj: Option<u32>,
	framerate: Option<u32>,
	timeout_secs: Option<u32>,
	starting_slots: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = RelaySettings::default();
		let r = file.relay;

		let bind_ip = r.bind_ip.filter(|s| !s.trim().is_empty()).and_then(|s| match s.trim().parse::<IpAddr>() {
			Ok(ip) => Some(ip),
			Err(e) => {
				warn!(error = %e, bind_ip = %s, "relay config: invalid bind_ip; using dual-stack default");
				None
			}
		});

		let relay = RelaySettings {
			bind_ip,
			port: r.port.unwrap_or(defaults.port),
			max_clients: r.max_clients.unwrap_or(defaults.max_clients),
			client_pool: r.client_pool.unwrap_or(defaults.client_pool),
			client_pool_recovery_per_sec: r
				.client_pool_recovery_per_sec
				.unwrap_or(defaults.client_pool_recovery_per_sec),
			usage: crate::server::usage::UsageSettings {
				pool: r.usage_pool.unwrap_or(defaults.usage.pool),
				recovery_per_sec: r.usage_pool_recovery_per_sec.unwrap_or(defaults.usage.recovery_per_sec),
				header_adj: r.header_adj.unwrap_or(defaults.usage.header_adj),
				proc_adj: r.proc_adj.unwrap_or(defaults.usage.proc_adj),
			},
			framerate: r.framerate.unwrap_or(defaults.framerate),
			timeout_secs: r.timeout_secs.unwrap_or(defaults.timeout_secs),
			starting_slots: r.starting_slots.unwrap_or(defaults.starting_slots),
		};

		Self {
			relay,
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
			},
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("TICKRELAY_BIND_IP")
		&& let Ok(ip) = v.trim().parse::<IpAddr>()
	{
		cfg.relay.bind_ip = Some(ip);
		info!(%ip, "relay config: bind_ip overridden by env");
	}

	if let Ok(v) = std::env::var("TICKRELAY_PORT")
		&& let Ok(port) = v.trim().parse::<u16>()
	{
		cfg.relay.port = port;
		info!(port, "relay config: port overridden by env");
	}

	if let Ok(v) = std::env::var("TICKRELAY_MAX_CLIENTS")
		&& let Ok(max) = v.trim().parse::<usize>()
	{
		cfg.relay.max_clients = max;
		info!(max, "relay config: max_clients overridden by env");
	}

	if let Ok(v) = std::env::var("TICKRELAY_CLIENT_POOL")
		&& let Ok(pool) = v.trim().parse::<u32>()
	{
		cfg.relay.client_pool = pool;
		info!(pool, "relay config: client_pool overridden by env");
	}

	if let Ok(v) = std::env::var("TICKRELAY_CLIENT_POOL_RECOVERY_PER_SEC")
		&& let Ok(rate) = v.trim().parse::<f64>()
	{
		cfg.relay.client_pool_recovery_per_sec = rate;
		info!(rate, "relay config: client_pool_recovery_per_sec overridden by env");
	}

	if let Ok(v) = std::env::var("TICKRELAY_USAGE_POOL")
		&& let Ok(pool) = v.trim().parse::<u64>()
	{
		cfg.relay.usage.pool = pool;
		info!(pool, "relay config: usage_pool overridden by env");
	}

	if let Ok(v) = std::env::var("TICKRELAY_USAGE_POOL_RECOVERY_PER_SEC")
		&& let Ok(rate) = v.trim().parse::<u64>()
	{
		cfg.relay.usage.recovery_per_sec = rate;
		info!(rate, "relay config: usage_pool_recovery_per_sec overridden by env");
	}

	if let Ok(v) = std::env::var("TICKRELAY_FRAMERATE")
		&& let Ok(framerate) = v.trim().parse::<u32>()
	{
		cfg.relay.framerate = framerate;
		info!(framerate, "relay config: framerate overridden by env");
	}

	if let Ok(v) = std::env::var("TICKRELAY_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u32>()
	{
		cfg.relay.timeout_secs = secs;
		info!(secs, "relay config: timeout_secs overridden by env");
	}

	if let Ok(v) = std::env::var("TICKRELAY_STARTING_SLOTS")
		&& let Ok(slots) = v.trim().parse::<usize>()
	{
		cfg.relay.starting_slots = slots;
		info!(slots, "relay config: starting_slots overridden by env");
	}

	if let Ok(v) = std::env::var("TICKRELAY_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("TICKRELAY_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write as _;

	use super::*;

	fn temp_config(name: &str, contents: &str) -> PathBuf {
		let dir = std::env::temp_dir().join(format!("tickrelay-config-{}-{name}", std::process::id()));
		fs::create_dir_all(&dir).expect("create temp dir");
		let path = dir.join("config.toml");
		let mut f = fs::File::create(&path).expect("create config");
		f.write_all(contents.as_bytes()).expect("write config");
		path
	}

	#[test]
	fn missing_file_yields_defaults() {
		let path = std::env::temp_dir().join("tickrelay-definitely-missing").join("config.toml");
		let cfg = load_server_config_from_path(&path).expect("defaults");
		assert_eq!(cfg.relay.max_clients, 32);
		assert_eq!(cfg.relay.framerate, 15);
		assert_eq!(cfg.relay.usage.pool, 4 * 1024 * 1024);
	}

	#[test]
	fn file_values_override_defaults() {
		let path = temp_config(
			"override",
			r#"
[relay]
bind_ip = "127.0.0.1"
max_clients = 8
framerate = 30
timeout_secs = 2
starting_slots = 3

[server]
health_bind = "127.0.0.1:9000"
"#,
		);

		let cfg = load_server_config_from_path(&path).expect("load");
		assert_eq!(cfg.relay.bind_ip, Some("127.0.0.1".parse().expect("ip")));
		assert_eq!(cfg.relay.max_clients, 8);
		assert_eq!(cfg.relay.timeout_ticks(), 60);
		assert_eq!(cfg.relay.starting_slots, 3);
		assert_eq!(cfg.relay.client_pool, 32);
		assert_eq!(cfg.server.health_bind.as_deref(), Some("127.0.0.1:9000"));
		assert_eq!(cfg.server.metrics_bind, None);
	}

	#[test]
	fn out_of_range_values_fall_back() {
		let path = temp_config(
			"sanitize",
			r#"
[relay]
max_clients = 0
framerate = 0
starting_slots = 500
"#,
		);

		let cfg = load_server_config_from_path(&path).expect("load");
		let defaults = RelaySettings::default();
		assert_eq!(cfg.relay.max_clients, defaults.max_clients);
		assert_eq!(cfg.relay.framerate, defaults.framerate);
		assert_eq!(cfg.relay.starting_slots, defaults.max_clients);
	}

	#[test]
	fn malformed_toml_is_an_error() {
		let path = temp_config("broken", "[relay\nport = ");
		assert!(load_server_config_from_path(&path).is_err());
	}
}
