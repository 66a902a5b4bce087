mod config;
mod error;
mod locator;
mod pipeline;
mod process;
mod state;
mod supervisor;
#[cfg(test)]
mod testing;

use clap::Parser;
use config::StreamSettings;
use locator::Locator;
use process::SystemLauncher;
use state::WaitOutcome;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use supervisor::Supervisor;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// RTSP Streamer - 树莓派摄像头推流
/// 加载配置，启动 MediaMTX 及采集进程，直到收到退出信号
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径 (默认 ~/Desktop/stream.json)
    #[arg(short, long, env = "RTSP_STREAMER_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // 初始化日志系统，默认 info 级别
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(config::default_config_path);

    // 配置错误直接退出
    let settings = StreamSettings::load_or_create(&config_path)?;

    info!("{}", "=".repeat(50));
    info!("RTSP Streamer");
    info!("Config: {}", config_path.display());
    info!("Resolution: {}", settings.resolution);
    info!("FPS: {}", settings.fps);
    info!("Mode: {:?}", settings.mode);
    info!("RTSP URL: {}", settings.rtsp_url());
    info!("{}", "=".repeat(50));

    // 先注册信号，启动阶段收到的信号同样生效
    let cancel = CancellationToken::new();
    let sigint = signal(SignalKind::interrupt())?;
    let sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(forward_signals(sigint, sigterm, cancel.clone()));

    let mut supervisor = Supervisor::new(settings, Arc::new(SystemLauncher), Locator::from_env());

    Ok(run(&mut supervisor, &cancel).await)
}

/// 启动并运行直到停止请求或子进程退出
///
/// 启动失败或启动期间被取消返回失败，其余情况停止后正常退出
async fn run(supervisor: &mut Supervisor, cancel: &CancellationToken) -> ExitCode {
    let started = tokio::select! {
        result = supervisor.start() => Some(result),
        _ = cancel.cancelled() => None,
    };

    match started {
        Some(Ok(())) => {}
        Some(Err(e)) => {
            // start 内部已完成清理
            error!("Failed to start streaming ({}): {}", e.phase(), e);
            return ExitCode::FAILURE;
        }
        None => {
            warn!("Interrupted during startup");
            supervisor.stop().await;
            return ExitCode::FAILURE;
        }
    }

    let outcome = supervisor.wait(cancel).await;
    match outcome {
        WaitOutcome::Exited { name } => warn!(
            "Shutting down after {} exited, still running: {:?}",
            name,
            supervisor.live_processes()
        ),
        WaitOutcome::Cancelled | WaitOutcome::NotRunning => {}
    }
    supervisor.stop().await;

    ExitCode::SUCCESS
}

/// SIGINT / SIGTERM 都转为取消请求，重复信号只记录
async fn forward_signals(mut sigint: Signal, mut sigterm: Signal, cancel: CancellationToken) {
    loop {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        if cancel.is_cancelled() {
            info!("Received {}, shutdown already in progress", name);
        } else {
            info!("Received {}, shutting down", name);
            cancel.cancel();
        }
    }
}
