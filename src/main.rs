//! Veles CLI — server and client entry points.

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::signal;

use veles::cli::{Cli, Commands, ConnectArgs, GenKeyArgs, ServeArgs};
use veles::client::{handshake, ClientPaths, ClientSession};
use veles::config::{init_logging, Config};
use veles::crypto::PresharedKey;
use veles::server::{http, VpnServer};
use veles::transport::{dial, tls};
use veles::tun::{check_privileges, routing, TunDevice};
use veles::types::HelloInfo;
use veles::MTU;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(ref path) = cli.config {
        Config::load(path)?
    } else if Config::default_path().exists() {
        Config::load(Config::default_path())?
    } else {
        Config::default()
    };

    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    init_logging(&config.logging)?;

    match cli.command {
        Commands::Serve(args) => run_serve(args, config).await,
        Commands::Connect(args) => run_connect(args, config).await,
        Commands::GenKey(args) => run_gen_key(&args),
    }
}

fn load_key(path: Option<&std::path::Path>) -> anyhow::Result<PresharedKey> {
    let path = path.context(
        "a pre-shared key is required; generate one with `veles gen-key` \
         and pass it via --key-file",
    )?;
    PresharedKey::load(path).with_context(|| format!("load key from {}", path.display()))
}

async fn run_serve(args: ServeArgs, mut config: Config) -> anyhow::Result<()> {
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(admin) = args.admin {
        config.server.admin_addr = Some(admin);
    }
    if args.no_tls {
        config.server.tls = false;
    }
    if let Some(cert) = args.tls_cert {
        config.server.tls_cert = cert;
    }
    if let Some(key) = args.tls_key {
        config.server.tls_key = key;
    }
    if let Some(key_file) = args.key_file {
        config.server.key_file = Some(key_file);
    }
    if let Some(tun_name) = args.tun_name {
        config.server.tun_name = tun_name;
    }

    let key = load_key(config.server.key_file.as_deref())?;

    if !check_privileges() {
        tracing::warn!("TUN devices require elevated privileges (root or CAP_NET_ADMIN)");
    }

    let tun = TunDevice::create(&config.server.tun_name, MTU)
        .context("create server TUN device")?;
    routing::server_setup(tun.name()).context("configure server networking")?;

    let acceptor = if config.server.tls {
        Some(
            tls::acceptor(&config.server.tls_cert, &config.server.tls_key)
                .context("load TLS material")?,
        )
    } else {
        None
    };

    let server = Arc::new(VpnServer::new(Arc::new(tun), key, acceptor));
    let shutdown = server.shutdown_handle();

    if let Some(admin_addr) = config.server.admin_addr {
        let state = http::AdminState::new(server.registry());
        let admin_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve(admin_addr, state, admin_shutdown).await {
                tracing::error!(error = %e, "admin surface failed");
            }
        });
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = signal::ctrl_c().await;
            tracing::info!("shutdown requested");
            shutdown.trigger();
        });
    }

    let listener = tokio::net::TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("bind {}", config.server.listen_addr))?;

    server.run(listener).await?;
    Ok(())
}

async fn run_connect(args: ConnectArgs, mut config: Config) -> anyhow::Result<()> {
    if let Some(server) = args.server {
        config.client.server_addr = Some(server);
    }
    if args.encrypt {
        config.client.encrypt = true;
    }
    if args.no_tls {
        config.client.tls = false;
    }
    if let Some(key_file) = args.key_file {
        config.client.key_file = Some(key_file);
    }
    if args.no_timeout {
        config.client.dev_timeout = None;
    }
    if let Some(port) = args.ipc_port {
        config.ipc.listen_addr.set_port(port);
    }
    if let Some(tun_name) = args.tun_name {
        config.client.tun_name = tun_name;
    }

    let Some(server_addr) = config.client.server_addr.clone() else {
        bail!("server address required: pass --server, set VELES_SERVER, or configure it");
    };

    let key = if config.client.encrypt {
        Some(load_key(config.client.key_file.as_deref())?)
    } else {
        None
    };

    if !check_privileges() {
        tracing::warn!("TUN devices require elevated privileges (root or CAP_NET_ADMIN)");
    }

    let mut stream = dial(&server_addr, config.client.tls).await?;
    let assigned = handshake(&mut stream, config.client.encrypt, &HelloInfo::local()).await?;

    let tun = TunDevice::create(&config.client.tun_name, MTU)
        .context("create client TUN device")?;

    let server_host = server_addr
        .rsplit_once(':')
        .map_or(server_addr.as_str(), |(host, _)| host);
    let mut routes = routing::ClientRouting::new(tun.name(), assigned, server_host);
    if let Err(e) = routes.setup() {
        // Never leave half-applied routes behind.
        routes.teardown();
        return Err(e).context("configure client routing");
    }

    let ipc_listener = tokio::net::TcpListener::bind(config.ipc.listen_addr)
        .await
        .with_context(|| format!("bind IPC surface on {}", config.ipc.listen_addr))?;

    let session = ClientSession::new(
        Arc::new(tun),
        stream,
        key,
        ClientPaths::from(&config.ipc),
    );
    let shutdown = session.shutdown_handle();

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = signal::ctrl_c().await;
            tracing::info!("shutting down");
            shutdown.trigger();
        });
    }

    if let Some(timeout) = config.client.dev_timeout {
        tracing::info!(
            seconds = timeout.as_secs(),
            "development mode: client will shut down automatically (--no-timeout disables)"
        );
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::info!("safety timeout reached");
            shutdown.trigger();
        });
    } else {
        tracing::info!("running in production mode (no timeout)");
    }

    let result = session.run(ipc_listener).await;

    // Best effort; errors here must not mask the session result.
    routes.teardown();

    match result {
        Ok(()) => {
            tracing::info!("disconnected");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "connection lost");
            Err(e.into())
        }
    }
}

fn run_gen_key(args: &GenKeyArgs) -> anyhow::Result<()> {
    let key = PresharedKey::generate();

    if let Some(ref path) = args.output {
        std::fs::write(path, key.to_hex())
            .with_context(|| format!("write key to {}", path.display()))?;
        println!("Pre-shared key written to {}", path.display());
        println!("Distribute the same file to the server and every client.");
    } else {
        println!("{}", key.to_hex());
    }

    Ok(())
}
