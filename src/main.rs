use clap::Parser;
use relaygate::config::{ConfigOverrides, GatewayConfig, ListenerConfig, TlsConfig, parse_listeners};
use relaygate::error::AppError;
use std::path::PathBuf;
use tokio::task::JoinSet;

#[derive(Parser)]
#[command(name = "relaygate")]
#[command(version)]
#[command(about = "Streaming LLM gateway with static upstream priority", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Listeners as iface:port pairs, comma separated (replaces the config file's)
    #[arg(long)]
    listeners: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    #[arg(long)]
    cert_file: Option<PathBuf>,

    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Serve plain HTTP even if the config enables TLS
    #[arg(long)]
    no_tls: bool,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run(Cli::parse()).await {
        eprintln!("error: {}", err.message);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let (listeners, skipped) = match cli.listeners.as_deref() {
        Some(raw) => {
            let (listeners, skipped) = parse_listeners(raw);
            (Some(listeners), skipped)
        }
        None => (None, Vec::new()),
    };
    let overrides = ConfigOverrides {
        listeners,
        log_level: cli.log_level,
        cert_file: cli.cert_file,
        key_file: cli.key_file,
        disable_tls: cli.no_tls,
    };
    let config = GatewayConfig::load(&cli.config, overrides)
        .map_err(|err| AppError::internal(err.to_string()))?;

    let _log_guard = relaygate::logging::init(&config.log)
        .map_err(|err| AppError::internal(err.to_string()))?;
    for entry in &skipped {
        tracing::warn!(listener = %entry, "skipping malformed listener");
    }
    tracing::info!(
        hostname = %relaygate::logging::host_name(),
        config = %cli.config.display(),
        "starting relaygate"
    );

    let listeners = config.listeners.clone();
    let tls = config.tls.clone();
    let state = relaygate::app::load_state(config)?;
    let app = relaygate::app::build_app(state);

    let mut tasks = JoinSet::new();
    for listener in listeners {
        let app = app.clone();
        let tls = tls.clone();
        tasks.spawn(async move {
            let addr = listener.address();
            if let Err(err) = serve_listener(listener, tls, app).await {
                tracing::error!(addr = %addr, error = %err, "listener stopped");
            }
        });
    }
    while tasks.join_next().await.is_some() {}
    tracing::info!("all listeners stopped");
    Ok(())
}

async fn serve_listener(
    listener: ListenerConfig,
    tls: Option<TlsConfig>,
    app: axum::Router,
) -> std::io::Result<()> {
    let addr = tokio::net::lookup_host(listener.address())
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("no address for {}", listener.address()),
            )
        })?;
    match tls {
        Some(tls) => {
            let rustls = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                &tls.cert_file,
                &tls.key_file,
            )
            .await?;
            tracing::info!(addr = %addr, "listening with TLS");
            axum_server::bind_rustls(addr, rustls)
                .serve(app.into_make_service())
                .await
        }
        None => {
            let socket = tokio::net::TcpListener::bind(addr).await?;
            tracing::info!(addr = %addr, "listening");
            axum::serve(socket, app).await
        }
    }
}
