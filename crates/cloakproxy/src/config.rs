use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use proxy_core::strng::Strng;
use serde::Deserialize;

/// On-disk configuration shape. Every field is optional; defaults and
/// environment overrides are applied by [`parse_config`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawConfig {
	pub addr: Option<String>,
	pub cert_file: Option<PathBuf>,
	pub key_file: Option<PathBuf>,
	pub max_conns: Option<u64>,
	pub idle_close: Option<String>,
	pub dial_timeout: Option<String>,
	pub token: Option<String>,
	pub device_filter: Option<bool>,
	pub reporter: Option<bool>,
	pub report_interval: Option<String>,
	pub allowed_connect_ports: Option<Vec<u16>>,
	pub rate_limits: Option<HashMap<String, String>>,
	pub rate_limit_clients: Option<usize>,
	pub block_local_exceptions: Option<Vec<String>>,
	pub trust_forwarded: Option<bool>,
	pub ok_waits_for_upstream: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
	pub cert_file: PathBuf,
	pub key_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
	pub addr: String,
	pub tls: Option<TlsConfig>,
	/// 0 means unbounded.
	pub max_conns: u64,
	pub idle_timeout: Duration,
	pub dial_timeout: Duration,
	pub token: Option<Strng>,
	pub enable_device_filter: bool,
	pub enable_reporter: bool,
	pub report_interval: Duration,
	pub allowed_connect_ports: Vec<u16>,
	pub rate_limits: HashMap<Strng, Duration>,
	pub rate_limit_clients: usize,
	pub block_local_exceptions: Vec<String>,
	pub trust_forwarded: bool,
	pub ok_waits_for_upstream: bool,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			addr: "127.0.0.1:8080".to_string(),
			tls: None,
			max_conns: 0,
			idle_timeout: Duration::from_secs(30),
			dial_timeout: Duration::from_secs(10),
			token: None,
			enable_device_filter: false,
			enable_reporter: false,
			report_interval: Duration::from_secs(30),
			allowed_connect_ports: Vec::new(),
			rate_limits: HashMap::new(),
			rate_limit_clients: 0,
			block_local_exceptions: Vec::new(),
			trust_forwarded: false,
			ok_waits_for_upstream: true,
		}
	}
}

fn parse<T: FromStr>(env_name: &str) -> anyhow::Result<Option<T>>
where
	T::Err: std::error::Error + Send + Sync + 'static,
{
	match env::var(format!("CLOAKPROXY_{env_name}")) {
		Ok(val) if !val.is_empty() => val
			.parse::<T>()
			.map(Some)
			.with_context(|| format!("invalid CLOAKPROXY_{env_name}: {val}")),
		_ => Ok(None),
	}
}

fn parse_duration(text: &str) -> anyhow::Result<Duration> {
	duration_str::parse(text).map_err(|e| anyhow::anyhow!("invalid duration {text:?}: {e}"))
}

/// Build the effective configuration from YAML contents, applying
/// `CLOAKPROXY_*` environment overrides on top.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
	let raw: RawConfig = serde_yaml::from_str(contents).context("parse configuration")?;
	let defaults = Config::default();

	let cert_file = parse::<PathBuf>("CERT_FILE")?.or(raw.cert_file);
	let key_file = parse::<PathBuf>("KEY_FILE")?.or(raw.key_file);
	let tls = match (cert_file, key_file) {
		(Some(cert_file), Some(key_file)) => Some(TlsConfig {
			cert_file,
			key_file,
		}),
		(None, None) => None,
		_ => anyhow::bail!("certFile and keyFile must be set together"),
	};

	let idle_timeout = match parse::<String>("IDLE_CLOSE")?.or(raw.idle_close) {
		Some(text) => parse_duration(&text)?,
		None => defaults.idle_timeout,
	};
	let dial_timeout = match parse::<String>("DIAL_TIMEOUT")?.or(raw.dial_timeout) {
		Some(text) => parse_duration(&text)?,
		None => defaults.dial_timeout,
	};
	let report_interval = match parse::<String>("REPORT_INTERVAL")?.or(raw.report_interval) {
		Some(text) => parse_duration(&text)?,
		None => defaults.report_interval,
	};

	let mut rate_limits = HashMap::new();
	for (host, period) in raw.rate_limits.unwrap_or_default() {
		rate_limits.insert(proxy_core::strng::new(&host), parse_duration(&period)?);
	}

	let token = parse::<String>("TOKEN")?
		.or(raw.token)
		.filter(|t| !t.is_empty())
		.map(|t| proxy_core::strng::new(&t));

	Ok(Config {
		addr: parse::<String>("ADDR")?
			.or(raw.addr)
			.unwrap_or(defaults.addr),
		tls,
		max_conns: parse::<u64>("MAX_CONNS")?
			.or(raw.max_conns)
			.unwrap_or(defaults.max_conns),
		idle_timeout,
		dial_timeout,
		token,
		enable_device_filter: parse::<bool>("DEVICE_FILTER")?
			.or(raw.device_filter)
			.unwrap_or(defaults.enable_device_filter),
		enable_reporter: parse::<bool>("REPORTER")?
			.or(raw.reporter)
			.unwrap_or(defaults.enable_reporter),
		report_interval,
		allowed_connect_ports: raw
			.allowed_connect_ports
			.unwrap_or(defaults.allowed_connect_ports),
		rate_limits,
		rate_limit_clients: raw
			.rate_limit_clients
			.unwrap_or(defaults.rate_limit_clients),
		block_local_exceptions: raw
			.block_local_exceptions
			.unwrap_or(defaults.block_local_exceptions),
		trust_forwarded: parse::<bool>("TRUST_FORWARDED")?
			.or(raw.trust_forwarded)
			.unwrap_or(defaults.trust_forwarded),
		ok_waits_for_upstream: raw
			.ok_waits_for_upstream
			.unwrap_or(defaults.ok_waits_for_upstream),
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_config_gets_defaults() {
		let cfg = parse_config("{}").unwrap();
		assert_eq!(cfg.addr, "127.0.0.1:8080");
		assert_eq!(cfg.idle_timeout, Duration::from_secs(30));
		assert_eq!(cfg.dial_timeout, Duration::from_secs(10));
		assert_eq!(cfg.max_conns, 0);
		assert!(cfg.token.is_none());
		assert!(cfg.tls.is_none());
		assert!(cfg.ok_waits_for_upstream);
	}

	#[test]
	fn yaml_fields_apply() {
		let cfg = parse_config(
			r#"
addr: "0.0.0.0:9090"
maxConns: 1000
idleClose: 45s
token: sekrit
allowedConnectPorts: [443, 80]
rateLimits:
  throttled.test: 500ms
blockLocalExceptions: ["localhost"]
"#,
		)
		.unwrap();
		assert_eq!(cfg.addr, "0.0.0.0:9090");
		assert_eq!(cfg.max_conns, 1000);
		assert_eq!(cfg.idle_timeout, Duration::from_secs(45));
		assert_eq!(cfg.token.as_deref(), Some("sekrit"));
		assert_eq!(cfg.allowed_connect_ports, vec![443, 80]);
		assert_eq!(
			cfg.rate_limits.get("throttled.test"),
			Some(&Duration::from_millis(500))
		);
		assert_eq!(cfg.block_local_exceptions, vec!["localhost".to_string()]);
	}

	#[test]
	fn mismatched_tls_pair_is_rejected() {
		assert!(parse_config("certFile: /tmp/cert.pem").is_err());
	}

	#[test]
	fn unknown_fields_are_rejected() {
		assert!(parse_config("nonsense: true").is_err());
	}
}
