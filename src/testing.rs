//! 测试用的进程启动器，不启动真实进程，只记录调用顺序

use crate::config::{StreamSettings, SupervisorPolicy};
use crate::locator::Locator;
use crate::process::{LaunchSpec, Launcher, ManagedProcess};
use crate::supervisor::Supervisor;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};
use tokio::net::TcpListener;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Behavior {
    #[default]
    Normal,
    /// spawn 直接报错
    FailSpawn,
    /// 启动后立即退出
    ExitImmediately,
    /// 忽略 SIGTERM，只能被强杀
    IgnoreTerminate,
    /// 发送 SIGTERM 报错，进程不退出
    FailTerminate,
    /// 等待退出时报错
    FailWait,
    /// 启动一段时间后自行退出
    ExitAfter(Duration),
}

#[derive(Debug)]
struct FakeState {
    alive: bool,
    exit_at: Option<Instant>,
    behavior: Behavior,
}

impl FakeState {
    fn alive(&self) -> bool {
        self.alive && self.exit_at.map_or(true, |at| Instant::now() < at)
    }
}

#[derive(Default)]
struct Inner {
    events: Vec<String>,
    behaviors: HashMap<String, Behavior>,
    processes: Vec<(String, Arc<Mutex<FakeState>>)>,
}

#[derive(Clone, Default)]
pub struct FakeLauncher {
    inner: Arc<Mutex<Inner>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, name: &str, behavior: Behavior) -> Self {
        self.inner
            .lock()
            .unwrap()
            .behaviors
            .insert(name.to_string(), behavior);
        self
    }

    pub fn events(&self) -> Vec<String> {
        self.inner.lock().unwrap().events.clone()
    }

    /// 指定前缀的事件，去掉前缀后返回
    pub fn events_of(&self, kind: &str) -> Vec<String> {
        let prefix = format!("{}:", kind);
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    /// 模拟进程自行退出
    pub fn exit(&self, name: &str) {
        let inner = self.inner.lock().unwrap();
        for (n, state) in &inner.processes {
            if n == name {
                state.lock().unwrap().alive = false;
            }
        }
    }

    /// 仍然存活的进程名
    pub fn alive(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .processes
            .iter()
            .filter(|(_, state)| state.lock().unwrap().alive())
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn record(&self, event: String) {
        self.inner.lock().unwrap().events.push(event);
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    fn spawn(&self, spec: LaunchSpec) -> io::Result<Box<dyn ManagedProcess>> {
        self.record(format!("spawn:{}", spec.name));
        let behavior = self
            .inner
            .lock()
            .unwrap()
            .behaviors
            .get(&spec.name)
            .copied()
            .unwrap_or_default();

        if behavior == Behavior::FailSpawn {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "spawn refused"));
        }

        let exit_at = match behavior {
            Behavior::ExitAfter(delay) => Some(Instant::now() + delay),
            _ => None,
        };
        let state = Arc::new(Mutex::new(FakeState {
            alive: behavior != Behavior::ExitImmediately,
            exit_at,
            behavior,
        }));
        self.inner
            .lock()
            .unwrap()
            .processes
            .push((spec.name.clone(), state.clone()));

        Ok(Box::new(FakeProcess {
            name: spec.name,
            state,
            launcher: self.clone(),
        }))
    }

    async fn kill_stale(&self, names: &[String]) {
        self.record(format!("kill_stale:{}", names.join(",")));
    }
}

pub struct FakeProcess {
    name: String,
    state: Arc<Mutex<FakeState>>,
    launcher: FakeLauncher,
}

impl FakeProcess {
    fn alive(&self) -> bool {
        self.state.lock().unwrap().alive()
    }

    fn behavior(&self) -> Behavior {
        self.state.lock().unwrap().behavior
    }
}

#[async_trait]
impl ManagedProcess for FakeProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> Option<u32> {
        None
    }

    fn try_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        if self.alive() {
            Ok(None)
        } else {
            Ok(Some(ExitStatus::from_raw(0)))
        }
    }

    fn take_stdout(&mut self) -> Option<Stdio> {
        None
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.launcher.record(format!("terminate:{}", self.name));
        let mut state = self.state.lock().unwrap();
        match state.behavior {
            Behavior::IgnoreTerminate => Ok(()),
            Behavior::FailTerminate => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "terminate refused",
            )),
            _ => {
                state.alive = false;
                Ok(())
            }
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        self.launcher.record(format!("kill:{}", self.name));
        self.state.lock().unwrap().alive = false;
        Ok(())
    }

    async fn wait_timeout(&mut self, limit: Duration) -> io::Result<bool> {
        if self.behavior() == Behavior::FailWait {
            return Err(io::Error::new(io::ErrorKind::Other, "wait failed"));
        }
        if !self.alive() {
            return Ok(true);
        }
        tokio::time::sleep(limit).await;
        Ok(!self.alive())
    }

    fn recent_output(&self) -> Vec<String> {
        vec![format!("{} fake output", self.name)]
    }
}

/// 生成一组可执行的空脚本，供 Locator 查找
pub fn tool_dir(names: &[&str]) -> TempDir {
    let dir = tempdir().unwrap();
    for name in names {
        let path = dir.path().join(name);
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    dir
}

pub fn all_tools() -> TempDir {
    tool_dir(&["mediamtx", "rpicam-vid", "ffmpeg"])
}

/// 缩短所有等待时间，关闭内存预检
pub fn fast_settings(port: u16) -> StreamSettings {
    StreamSettings {
        port,
        supervisor: SupervisorPolicy {
            port_poll_interval_ms: 20,
            port_timeout_ms: 500,
            monitor_interval_ms: 50,
            stop_timeout_ms: 100,
            settle_delay_ms: 0,
            capture_grace_ms: 50,
            kill_stale: true,
            min_free_memory_kb: 0,
        },
        ..Default::default()
    }
}

pub fn fake_supervisor(
    settings: StreamSettings,
    launcher: &FakeLauncher,
    tools: &Path,
) -> Supervisor {
    let locator = Locator {
        bundle_dir: Some(tools.to_path_buf()),
        ..Default::default()
    };
    Supervisor::new(settings, Arc::new(launcher.clone()), locator)
}

/// 模拟已经在监听的服务端
pub async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// 没有监听者的端口
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
