// Telescope supervisor daemon: polls the configured peers and serves the
// supervisor's command endpoint until `quit` or a shutdown signal.

mod config;
mod transport;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use fsm_core::{PeerRegistry, Supervisor};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Inbound commands waiting for the next tick.
const COMMAND_QUEUE: usize = 32;

#[derive(Debug, Default, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    send: Option<String>,
    version: bool,
}

fn parse_args(mut it: impl Iterator<Item = String>) -> anyhow::Result<Args> {
    let mut args = Args::default();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--version" | "-V" => args.version = true,
            "--config" | "-c" => {
                args.config = Some(it.next().context("--config needs a path")?.into());
            }
            "--send" => args.send = Some(it.next().context("--send needs a command")?),
            other => bail!("unknown argument {other:?}"),
        }
    }
    Ok(args)
}

fn main() -> anyhow::Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    if args.version {
        println!("fsm-daemon {}", VERSION);
        return Ok(());
    }
    init_tracing();

    let cfg = config::load(args.config.as_deref())?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        match args.send {
            Some(line) => send_command(&cfg, &line).await,
            None => serve(cfg).await,
        }
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("fsm_daemon=info,fsm_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn serve(cfg: config::Config) -> anyhow::Result<()> {
    let bind = cfg.supervisor.bind;
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("cannot bind command endpoint {}", bind))?;
    info!(%bind, version = VERSION, "command endpoint listening");

    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
    tokio::spawn(transport::serve_commands(listener, commands_tx));

    let mut registry = PeerRegistry::new(transport::TcpConnector, cfg.peer_timings());
    for peer in &cfg.peers {
        registry.add(&peer.name, peer.endpoint(), &peer.prefix)?;
        info!(
            peer = %peer.name,
            endpoint = %peer.endpoint(),
            prefix = %peer.prefix,
            description = peer.description().unwrap_or(""),
            "peer registered"
        );
    }

    let mut supervisor = Supervisor::new(registry, commands_rx, cfg.supervisor_config());
    tokio::select! {
        _ = supervisor.run() => {}
        r = shutdown_signal() => {
            r?;
            info!("shutdown signal received");
        }
    }
    Ok(())
}

async fn send_command(cfg: &config::Config, line: &str) -> anyhow::Result<()> {
    let endpoint = cfg.command_endpoint();
    let timeout = Duration::from_millis(cfg.supervisor.timeout_ms);
    let reply = transport::request(&endpoint, line, timeout)
        .await
        .with_context(|| format!("no reply from supervisor at {}", endpoint))?;
    println!("{}", String::from_utf8_lossy(&reply));
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> anyhow::Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn parses_flags() {
        assert_eq!(args(&[]).unwrap(), Args::default());
        let a = args(&["--config", "/tmp/fsm.toml", "--send", "status"]).unwrap();
        assert_eq!(a.config, Some(PathBuf::from("/tmp/fsm.toml")));
        assert_eq!(a.send.as_deref(), Some("status"));
        assert!(args(&["-V"]).unwrap().version);
    }

    #[test]
    fn rejects_bad_flags() {
        assert!(args(&["--config"]).is_err());
        assert!(args(&["--verbose"]).is_err());
    }
}
