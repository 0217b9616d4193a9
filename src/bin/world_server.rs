use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedSender};

use ember::config::ServerConfig;
use ember::core::{create_server_state, request_shutdown, SharedServerState};
use ember::network::listener::{run_listener, ListenerOptions};
use ember::network::Inbound;
use ember::persistence::{MemoryStore, Persistence};
use ember::servers::world::WorldServer;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut conf_file = "conf/world.yaml".to_string();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "--h" | "--?" | "/?" => {
                println!("Usage: world_server [--conf FILE]");
                return Ok(());
            }
            "--conf" if i + 1 < args.len() => {
                i += 1;
                conf_file = args[i].clone();
            }
            _ => {}
        }
        i += 1;
    }

    let config = Arc::new(
        ServerConfig::from_file(&conf_file).with_context(|| format!("Cannot load config: {}", conf_file))?,
    );

    let store = match &config.store_path {
        Some(path) => MemoryStore::open(path)?,
        None => {
            tracing::warn!("[world] no store_path set, accounts will not survive a restart");
            MemoryStore::new()
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Cannot start tokio runtime")?;
    let state = create_server_state();
    let (tx, rx) = mpsc::unbounded_channel();

    let listener = runtime
        .block_on(TcpListener::bind((config.bind_ip.as_str(), config.port)))
        .with_context(|| format!("Cannot bind {}:{}", config.bind_ip, config.port))?;
    let options = ListenerOptions {
        max_connections: config.max_connections,
        idle_timeout: config.idle_timeout(),
    };
    {
        let tx = tx.clone();
        let state = state.clone();
        runtime.spawn(async move {
            if let Err(e) = run_listener(listener, options, tx, state.clone()).await {
                tracing::error!("[net] listener failed: {:#}", e);
                request_shutdown(&state);
            }
        });
    }
    runtime.spawn(watch_signals(conf_file, tx, state.clone()));

    tracing::info!("[world] World Server Started.");

    let handle = runtime.handle().clone();
    let game = std::thread::Builder::new()
        .name("game".to_string())
        .spawn(move || {
            let store: Box<dyn Persistence> = Box::new(store);
            WorldServer::new(config, store, handle, rx, state).run();
        })
        .context("Cannot start game thread")?;
    game.join().map_err(|_| anyhow!("game thread panicked"))?;

    runtime.shutdown_timeout(Duration::from_secs(2));
    tracing::info!("[world] Stopped.");
    Ok(())
}

/// Ctrl-C shuts down; SIGHUP reloads the config file.
async fn watch_signals(conf_file: String, inbound: UnboundedSender<Inbound>, state: SharedServerState) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::hangup()) {
            Ok(mut hangup) => loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = hangup.recv() => rehash(&conf_file, &inbound),
                }
            },
            Err(e) => {
                tracing::warn!("[world] SIGHUP unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (&conf_file, &inbound);
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("[world] Shutting down...");
    request_shutdown(&state);
}

fn rehash(conf_file: &str, inbound: &UnboundedSender<Inbound>) {
    match ServerConfig::from_file(conf_file) {
        Ok(config) => {
            tracing::info!("[world] rehashing from {}", conf_file);
            let _ = inbound.send(Inbound::Rehash(Arc::new(config)));
        }
        Err(e) => tracing::warn!("[world] rehash failed, keeping old config: {:#}", e),
    }
}
