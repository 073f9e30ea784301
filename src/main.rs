use anyhow::{bail, Context};
use clap::Parser;
use proxy_tunnel::cli::{Cli, Commands};
use proxy_tunnel::config::{self, ConnectOptions, ProxyOptions, ServerConfig};
use proxy_tunnel::provider::ChannelProvider;
use proxy_tunnel::session::Session;
use proxy_tunnel::{proxy, server, tls, transport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志；显式的 RUST_LOG 优先于 -v 级别
    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Proxy {
            destination,
            bind_addr,
            bind_port,
            password,
            identity_file,
            keepalive,
            idle_timeout,
            ca_cert,
            skip_verify,
        } => {
            run_proxy_command(
                destination,
                bind_addr,
                bind_port,
                password,
                identity_file,
                keepalive,
                idle_timeout,
                ca_cert,
                skip_verify,
            )
            .await
        }
        Commands::Server { config } => run_server_command(&config).await,
        Commands::Check { config } => check_config(&config),
        Commands::Cert {
            cert_out,
            key_out,
            common_name,
            alt_names,
        } => generate_cert(&cert_out, &key_out, &common_name, &alt_names),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_proxy_command(
    destination: String,
    bind_addr: String,
    bind_port: u16,
    password: Option<String>,
    identity_file: Option<String>,
    keepalive: u64,
    idle_timeout: u64,
    ca_cert: Option<String>,
    skip_verify: bool,
) -> anyhow::Result<()> {
    let dest = config::parse_destination(&destination)?;

    let secret = match (password, identity_file) {
        (Some(password), _) => password,
        (None, Some(path)) => config::load_secret_file(&path)?,
        (None, None) => bail!("either --password or --identity-file is required"),
    };

    let connect_options = ConnectOptions {
        server_addr: dest.host,
        server_port: dest.port,
        user: dest.user,
        secret,
        keepalive: (keepalive > 0).then(|| Duration::from_secs(keepalive)),
        ca_cert_path: ca_cert.map(PathBuf::from),
        skip_verify,
    };
    let proxy_options = ProxyOptions {
        bind_addr,
        bind_port,
        idle_timeout: (idle_timeout > 0).then(|| Duration::from_secs(idle_timeout)),
    };

    if skip_verify {
        warn!("Certificate verification disabled, connection is not secure");
    }

    let tls_config = tls::load_client_config(connect_options.ca_cert_path.as_deref(), skip_verify)?;
    let connector = TlsConnector::from(tls_config);
    let transport = transport::create_transport_client(&connect_options, connector);

    let (session, events) = Session::new(Arc::new(connect_options), transport);
    let provider = Arc::new(ChannelProvider::new(session));
    provider.spawn_auto_reconnect(events);

    // 首次连接失败不致命；后续请求会惰性重建会话
    if let Err(e) = provider.connect().await {
        warn!("Initial connection failed, will retry on demand: {}", e);
    }

    proxy::run_proxy(proxy_options, provider).await?;
    Ok(())
}

async fn run_server_command(config_path: &str) -> anyhow::Result<()> {
    let config = ServerConfig::load(config_path)?;
    let (cert_path, key_path) = ensure_server_certs(&config)?;

    let tls_config = tls::load_server_config(&cert_path, &key_path)?;
    let acceptor = TlsAcceptor::from(tls_config);

    server::run_server(config, acceptor).await?;
    Ok(())
}

/// 当配置未指定证书时生成临时自签名证书
fn ensure_server_certs(config: &ServerConfig) -> anyhow::Result<(PathBuf, PathBuf)> {
    if let (Some(cert), Some(key)) = (&config.cert_path, &config.key_path) {
        return Ok((cert.clone(), key.clone()));
    }

    warn!("No certificate configured, generating a self-signed certificate");
    let dir = std::env::temp_dir().join(format!("proxy-tunnel-{}", std::process::id()));
    std::fs::create_dir_all(&dir).context("failed to create certificate directory")?;
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    tls::generate_self_signed_cert(
        "localhost",
        &[config.bind_addr.clone()],
        &cert_path,
        &key_path,
    )?;

    info!("Self-signed certificate written to {}", dir.display());
    Ok((cert_path, key_path))
}

fn check_config(config_path: &str) -> anyhow::Result<()> {
    match ServerConfig::load(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  bind: {}:{}", config.bind_addr, config.bind_port);
            match (&config.cert_path, &config.key_path) {
                (Some(cert), Some(key)) => {
                    println!("  cert: {}", cert.display());
                    println!("  key:  {}", key.display());
                }
                _ => println!("  cert: (self-signed, generated at startup)"),
            }
            println!(
                "  connect timeout: {}s",
                config.connect_timeout().as_secs()
            );
            Ok(())
        }
        Err(e) => {
            println!("✗ Configuration is invalid: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn generate_cert(
    cert_out: &str,
    key_out: &str,
    common_name: &str,
    alt_names: &[String],
) -> anyhow::Result<()> {
    tls::generate_self_signed_cert(
        common_name,
        alt_names,
        Path::new(cert_out),
        Path::new(key_out),
    )?;

    println!("Certificate written to {}", cert_out);
    println!("Private key written to {}", key_out);
    Ok(())
}
