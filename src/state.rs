use std::fmt;

/// 监控器的生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopping,
    /// 终态
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Stopping => "stopping",
            SupervisorState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// 监控循环结束的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// 收到停止请求
    Cancelled,
    /// 某个子进程意外退出
    Exited { name: String },
    /// 未处于运行状态，没有可监控的进程
    NotRunning,
}
