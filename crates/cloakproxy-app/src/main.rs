use std::path::PathBuf;

use clap::Parser;
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "Masquerading HTTP forward proxy", long_about = None)]
struct Args {
	/// Configuration file (YAML)
	#[arg(short, long, value_name = "file")]
	file: Option<PathBuf>,

	/// Address to listen on
	#[arg(long, value_name = "addr")]
	addr: Option<String>,

	/// TLS private key file; requires --cert
	#[arg(long, value_name = "key")]
	key: Option<PathBuf>,

	/// TLS certificate file; requires --key
	#[arg(long, value_name = "cert")]
	cert: Option<PathBuf>,

	/// Max simultaneous connections (0 = unbounded)
	#[arg(long, value_name = "maxconns")]
	maxconns: Option<u64>,

	/// Seconds an idle connection is kept before closing
	#[arg(long, value_name = "idleclose")]
	idleclose: Option<u64>,

	/// Auth token clients must present; empty disables the check
	#[arg(long, value_name = "token")]
	token: Option<String>,

	/// Require a device id and meter per-client traffic
	#[arg(long)]
	device_filter: bool,

	/// Enable the periodic per-connection stats reporter
	#[arg(long)]
	reporter: bool,

	/// Only validate the configuration, then exit
	#[arg(long)]
	validate_only: bool,
}

fn main() -> anyhow::Result<()> {
	proxy_core::telemetry::setup_logging();
	let args = Args::parse();

	let contents = match &args.file {
		Some(path) => std::fs::read_to_string(path)?,
		None => "{}".to_string(),
	};
	let mut config = cloakproxy::parse_config(&contents)?;
	apply_flags(&mut config, &args)?;

	if args.validate_only {
		println!("Configuration is valid!");
		return Ok(());
	}

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(async move {
			info!(addr = config.addr.as_str(), "starting proxy");
			cloakproxy::Server::run(config).await
		})
}

fn apply_flags(config: &mut cloakproxy::Config, args: &Args) -> anyhow::Result<()> {
	if let Some(addr) = &args.addr {
		config.addr = addr.clone();
	}
	match (&args.key, &args.cert) {
		(Some(key), Some(cert)) => {
			config.tls = Some(cloakproxy::config::TlsConfig {
				cert_file: cert.clone(),
				key_file: key.clone(),
			});
		},
		(None, None) => {},
		_ => anyhow::bail!("--key and --cert must be given together"),
	}
	if let Some(maxconns) = args.maxconns {
		config.max_conns = maxconns;
	}
	if let Some(secs) = args.idleclose {
		config.idle_timeout = std::time::Duration::from_secs(secs);
	}
	if let Some(token) = &args.token
		&& !token.is_empty()
	{
		config.token = Some(proxy_core::strng::new(token));
	}
	if args.device_filter {
		config.enable_device_filter = true;
	}
	if args.reporter {
		config.enable_reporter = true;
	}
	Ok(())
}
