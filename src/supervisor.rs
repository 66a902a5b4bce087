use crate::config::{StreamSettings, SupervisorPolicy};
use crate::error::StartError;
use crate::locator::Locator;
use crate::pipeline::{publish_url, LaunchPlan};
use crate::process::{LaunchSpec, Launcher, ManagedProcess};
use crate::state::{SupervisorState, WaitOutcome};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 端口探测使用本机回环地址
const PROBE_HOST: &str = "127.0.0.1";
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// 推流进程组的监控器
///
/// 进程按启动顺序保存 (服务端、采集、转发)，停止时倒序处理
pub struct Supervisor {
    settings: StreamSettings,
    launcher: Arc<dyn Launcher>,
    locator: Locator,
    processes: Vec<Box<dyn ManagedProcess>>,
    state: SupervisorState,
}

impl Supervisor {
    pub fn new(settings: StreamSettings, launcher: Arc<dyn Launcher>, locator: Locator) -> Self {
        Self {
            settings,
            launcher,
            locator,
            processes: Vec::new(),
            state: SupervisorState::Idle,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// 仍在运行的受管进程名
    pub fn live_processes(&mut self) -> Vec<String> {
        self.processes
            .iter_mut()
            .filter_map(|p| {
                if p.is_alive() {
                    Some(p.name().to_string())
                } else {
                    None
                }
            })
            .collect()
    }

    /// 启动整条推流链路
    ///
    /// # 任务流程：
    /// - 内存预检，查找可执行文件
    /// - 清理系统中残留的同名进程
    /// - 启动服务端并等待端口可连接
    /// - pipe 模式下启动采集和转发进程，宽限期后确认所有进程仍在运行
    ///
    /// 任一步骤失败都会先停止已启动的进程再返回错误
    pub async fn start(&mut self) -> Result<(), StartError> {
        if self.state != SupervisorState::Idle {
            return Err(StartError::InvalidState(self.state));
        }
        self.state = SupervisorState::Starting;

        match self.launch().await {
            Ok(()) => {
                self.state = SupervisorState::Running;
                info!("Stream started successfully!");
                Ok(())
            }
            Err(e) => {
                self.stop().await;
                Err(e)
            }
        }
    }

    async fn launch(&mut self) -> Result<(), StartError> {
        let policy = self.settings.supervisor.clone();
        check_memory(policy.min_free_memory_kb)?;

        info!("Locating binaries...");
        let plan = LaunchPlan::build(&self.settings, &self.locator)?;

        if policy.kill_stale {
            // 按进程名清理，会影响不属于本程序的同名进程
            self.launcher.kill_stale(&plan.stale_names).await;
            tokio::time::sleep(policy.settle_delay()).await;
        }

        let port = self.settings.port;
        info!(
            "Starting {} on {}...",
            plan.server.name,
            plan.server.env_value("MTX_RTSPADDRESS").unwrap_or_default()
        );
        let server = self.spawn(plan.server)?;
        wait_for_port(server, port, &policy).await?;
        info!("{} started successfully", server.name());

        let Some(chain) = plan.chain else {
            return Ok(());
        };

        info!(
            "Starting camera stream: {} @ {}fps",
            self.settings.resolution, self.settings.fps
        );
        info!("Publishing to {}", publish_url(&self.settings));

        let capture_stdout = self.spawn(chain.capture)?.take_stdout();
        if capture_stdout.is_none() {
            debug!("Capture stdout not available for piping");
        }
        // relay 的 LaunchSpec 在 spawn 中被消耗，管道只由子进程持有
        self.spawn(LaunchSpec {
            stdin: capture_stdout,
            ..chain.relay
        })?;

        tokio::time::sleep(policy.capture_grace()).await;
        // 服务端也可能在宽限期内退出 (例如端口被其他程序占用)
        for process in self.processes.iter_mut() {
            if let Ok(Some(status)) = process.try_exit() {
                return Err(early_exit(&**process, status));
            }
        }
        Ok(())
    }

    fn spawn(&mut self, spec: LaunchSpec) -> Result<&mut dyn ManagedProcess, StartError> {
        let name = spec.name.clone();
        let process = self
            .launcher
            .spawn(spec)
            .map_err(|source| StartError::Spawn { name, source })?;
        debug!("Started {} (pid {:?})", process.name(), process.id());
        self.processes.push(process);
        let last = self.processes.len() - 1;
        Ok(self.processes[last].as_mut())
    }

    /// 监控循环，直到收到停止请求或某个子进程退出
    pub async fn wait(&mut self, cancel: &CancellationToken) -> WaitOutcome {
        if self.state != SupervisorState::Running {
            return WaitOutcome::NotRunning;
        }

        let mut interval = tokio::time::interval(self.settings.supervisor.monitor_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Stop requested");
                    return WaitOutcome::Cancelled;
                }
                _ = interval.tick() => {}
            }

            for process in self.processes.iter_mut() {
                match process.try_exit() {
                    Ok(Some(status)) => {
                        let name = process.name().to_string();
                        warn!("{} process ended unexpectedly with: {}", name, status);
                        for line in process.recent_output() {
                            warn!("[{}] {}", name, line);
                        }
                        return WaitOutcome::Exited { name };
                    }
                    Ok(None) => {}
                    Err(e) => error!("Process monitor error [{}]: {}", process.name(), e),
                }
            }
        }
    }

    /// 停止所有进程，可重复调用
    pub async fn stop(&mut self) {
        self.state = SupervisorState::Stopping;
        if !self.processes.is_empty() {
            info!("Stopping stream...");
        }

        let limit = self.settings.supervisor.stop_timeout();
        // 后启动的先停
        while let Some(mut process) = self.processes.pop() {
            shutdown(process.as_mut(), limit).await;
        }

        self.state = SupervisorState::Stopped;
        info!("Stream stopped");
    }
}

/// SIGTERM，超时后 SIGKILL；错误只记录，不中断其他进程的停止
async fn shutdown(process: &mut dyn ManagedProcess, limit: Duration) {
    let name = process.name().to_string();
    if !process.is_alive() {
        debug!("{} already exited", name);
        return;
    }

    if let Err(e) = process.terminate() {
        warn!("Failed to send SIGTERM to {}: {}", name, e);
    }
    match process.wait_timeout(limit).await {
        Ok(true) => {
            info!("{} stopped", name);
            return;
        }
        Ok(false) => warn!("{} did not exit within {:?}, killing", name, limit),
        Err(e) => warn!("Failed to wait for {}: {}", name, e),
    }

    if let Err(e) = process.kill() {
        warn!("Failed to kill {}: {}", name, e);
    }
    match process.wait_timeout(limit).await {
        Ok(true) => info!("{} killed", name),
        Ok(false) => warn!("{} still running after SIGKILL", name),
        Err(e) => warn!("Failed to reap {}: {}", name, e),
    }
}

/// 轮询端口直到可连接；服务端提前退出时立即失败
async fn wait_for_port(
    server: &mut dyn ManagedProcess,
    port: u16,
    policy: &SupervisorPolicy,
) -> Result<(), StartError> {
    let timeout = policy.port_timeout();
    let deadline = Instant::now() + timeout;

    loop {
        if is_port_open(PROBE_HOST, port).await {
            return Ok(());
        }
        if let Ok(Some(status)) = server.try_exit() {
            return Err(early_exit(server, status));
        }
        if Instant::now() >= deadline {
            return Err(StartError::PortTimeout {
                name: server.name().to_string(),
                port,
                timeout,
            });
        }
        tokio::time::sleep(policy.port_poll_interval()).await;
    }
}

async fn is_port_open(host: &str, port: u16) -> bool {
    matches!(
        tokio::time::timeout(PROBE_CONNECT_TIMEOUT, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

fn early_exit(process: &dyn ManagedProcess, status: ExitStatus) -> StartError {
    let output = process.recent_output();
    let detail = if output.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, output.join(" | "))
    };
    StartError::EarlyExit {
        name: process.name().to_string(),
        detail,
    }
}

/// 启动前检查可用内存，0 表示跳过
fn check_memory(min_free_kb: u64) -> Result<(), StartError> {
    if min_free_kb == 0 {
        return Ok(());
    }

    match sys_info::mem_info() {
        Ok(mem) => {
            let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);
            info!(
                "System memory: {} MB available of {} MB, load {:.2}",
                mem.avail / 1024,
                mem.total / 1024,
                load
            );
            if mem.avail < min_free_kb {
                return Err(StartError::InsufficientMemory(mem.avail));
            }
        }
        Err(e) => {
            // 无法获取内存信息时不阻断启动
            warn!("Failed to check memory usage: {}", e);
        }
    }
    Ok(())
}
