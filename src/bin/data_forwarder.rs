//! data-forwarder - 日志转发 Agent
//!
//! Usage:
//!     data-forwarder --config /etc/data-forwarder.d/

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use data_forwarder::config::{self, parse_duration, Options};
use data_forwarder::sensor::Registry;
use data_forwarder::{Agent, ExitStatus};
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "data-forwarder", version, about = "Tails log files and forwards them to collectors")]
struct Args {
    /// 配置文件或目录（目录下所有文件按名称顺序合并）
    #[arg(short, long, env = "DATA_FORWARDER_CONFIG")]
    config: PathBuf,

    /// 事件数达到该值时立即发送
    #[arg(long, default_value_t = 1024)]
    spool_size: usize,

    /// Harvester 读缓冲大小（字节）
    #[arg(long = "harvest-buffer-size", default_value_t = 16 << 10)]
    harvester_buffer_size: usize,

    /// 空闲多久强制发送（如 5s、500ms）
    #[arg(long, default_value = "5s", value_parser = duration_arg)]
    idle_timeout: Duration,

    /// 文件截断后从头继续读
    #[arg(short, long)]
    tail: bool,

    /// 只输出警告和错误
    #[arg(short, long)]
    quiet: bool,

    /// 状态文件
    #[arg(long, default_value = ".data-forwarder")]
    state_file: PathBuf,

    /// 文件发现周期
    #[arg(long, default_value = "10s", value_parser = duration_arg)]
    prospect_interval: Duration,
}

fn duration_arg(raw: &str) -> Result<Duration, String> {
    parse_duration(raw)
}

impl Args {
    fn options(&self) -> Options {
        Options {
            config_arg: self.config.clone(),
            spool_size: self.spool_size,
            harvester_buffer_size: self.harvester_buffer_size,
            idle_timeout: self.idle_timeout,
            tail_on_rotate: self.tail,
            quiet: self.quiet,
            state_file: self.state_file.clone(),
            prospect_interval: self.prospect_interval,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.quiet { "warn" } else { "data_forwarder=info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    tracing::info!("data-forwarder v{} starting up", data_forwarder::VERSION);
    let options = args.options();
    options.emit();

    let config = match config::load(&options.config_arg) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Could not load config: {}", e);
            return ExitStatus::UsageError.into();
        }
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    let agent = Agent::new(config, options, Registry::new());
    let mut task = tokio::spawn(agent.run(stop_rx));

    let status = tokio::select! {
        result = &mut task => finish(result),
        _ = shutdown_signal() => {
            tracing::info!("Shutdown requested, draining pipeline (signal again to force exit)");
            let _ = stop_tx.send(true);
            tokio::select! {
                result = &mut task => finish(result),
                _ = shutdown_signal() => {
                    tracing::warn!("Forced exit, unacknowledged events will be resent on restart");
                    ExitStatus::Faulted
                }
            }
        }
    };

    tracing::info!("data-forwarder exiting ({:?})", status);
    status.into()
}

fn finish(
    result: Result<data_forwarder::Result<data_forwarder::StateTable>, tokio::task::JoinError>,
) -> ExitStatus {
    match result {
        Ok(Ok(states)) => {
            tracing::info!("Recorded positions for {} files", states.len());
            ExitStatus::Ok
        }
        Ok(Err(e)) if e.is_config() => {
            tracing::error!("Configuration error: {}", e);
            ExitStatus::UsageError
        }
        Ok(Err(e)) => {
            tracing::error!("Agent failed: {}", e);
            ExitStatus::Faulted
        }
        Err(e) if e.is_panic() => {
            tracing::error!("Agent panicked: {}", e);
            ExitStatus::Faulted
        }
        Err(e) => {
            tracing::error!("Agent task cancelled: {}", e);
            ExitStatus::Faulted
        }
    }
}

/// SIGINT 或 SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!("Cannot listen for SIGTERM: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
