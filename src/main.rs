use clap::Parser;
use tokio_util::sync::CancellationToken;

use accordbot::client::Client;
use accordbot::config::Config;
use accordbot::gateway::intents;

#[derive(Debug, Parser)]
#[command(name = "accordbot", version, about = "Chat and voice bot")]
struct Cli {
    /// Shard count; overrides ACCORDBOT_SHARDS and the platform recommendation.
    #[arg(long)]
    shards: Option<u32>,
    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "accordbot=debug".into());
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("accordbot: {e}");
            std::process::exit(2);
        }
    };
    if let Some(shards) = cli.shards.filter(|&n| n > 0) {
        config.shards = Some(shards);
    }
    print_banner(&config);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    if let Err(e) = Client::new(config, cancel).run().await {
        tracing::error!("accordbot stopped: {e}");
        std::process::exit(1);
    }
}

fn print_banner(config: &Config) {
    let version = env!("CARGO_PKG_VERSION");
    let sha = env!("GIT_SHA");
    let shards = config
        .shards
        .map(|n| n.to_string())
        .unwrap_or_else(|| "auto".to_string());
    let privileged = if config.master_key.is_some() {
        "enabled"
    } else {
        "disabled"
    };

    eprintln!();
    eprintln!("  \x1b[1;36maccordbot\x1b[0m \x1b[2mv{version} ({sha})\x1b[0m");
    eprintln!();
    eprintln!("  \x1b[2mgateway\x1b[0m      {}", config.gateway_url);
    eprintln!("  \x1b[2mshards\x1b[0m       {shards}");
    eprintln!("  \x1b[2mprefix\x1b[0m       {}", config.prefix);
    eprintln!("  \x1b[2mprivileged\x1b[0m   {privileged}");
    if config.intents & intents::PRIVILEGED != 0 {
        eprintln!("  \x1b[2mintents\x1b[0m      {} (includes privileged)", config.intents);
    } else {
        eprintln!("  \x1b[2mintents\x1b[0m      {}", config.intents);
    }
    if config.voice_receive {
        eprintln!();
        eprintln!("  \x1b[33m! voice receive enabled\x1b[0m");
    }
    eprintln!();
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
    cancel.cancel();
}
