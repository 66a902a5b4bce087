use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// 保留的子进程输出行数 (用于失败报告)
const OUTPUT_TAIL_LINES: usize = 20;

/// 一个待启动进程的描述
#[derive(Debug)]
pub struct LaunchSpec {
    /// 日志中使用的名称
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// 上游进程的输出，作为本进程的标准输入
    pub stdin: Option<Stdio>,
    /// 标准输出交给下游进程，而不是写入日志
    pub pipe_stdout: bool,
}

impl LaunchSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            pipe_stdout: false,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// 受管子进程句柄
#[async_trait]
pub trait ManagedProcess: Send {
    fn name(&self) -> &str;

    fn id(&self) -> Option<u32>;

    /// 非阻塞地检查是否已退出
    fn try_exit(&mut self) -> io::Result<Option<ExitStatus>>;

    fn is_alive(&mut self) -> bool {
        match self.try_exit() {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(e) => {
                warn!("Process monitor error [{}]: {}", self.name(), e);
                true
            }
        }
    }

    /// 取走标准输出，用于接入下游进程
    fn take_stdout(&mut self) -> Option<Stdio>;

    /// 请求优雅退出 (SIGTERM)
    fn terminate(&mut self) -> io::Result<()>;

    /// 强制结束 (SIGKILL)
    fn kill(&mut self) -> io::Result<()>;

    /// 等待退出，超时返回 false
    async fn wait_timeout(&mut self, limit: Duration) -> io::Result<bool>;

    fn recent_output(&self) -> Vec<String>;
}

/// 进程启动器
#[async_trait]
pub trait Launcher: Send + Sync {
    fn spawn(&self, spec: LaunchSpec) -> io::Result<Box<dyn ManagedProcess>>;

    /// 尽力结束系统中残留的同名进程，失败时忽略
    async fn kill_stale(&self, names: &[String]);
}

/// 基于 tokio::process 的启动器
#[derive(Debug, Default, Clone)]
pub struct SystemLauncher;

#[async_trait]
impl Launcher for SystemLauncher {
    fn spawn(&self, spec: LaunchSpec) -> io::Result<Box<dyn ManagedProcess>> {
        let LaunchSpec {
            name,
            program,
            args,
            env,
            stdin,
            pipe_stdout,
        } = spec;

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        cmd.envs(env);
        cmd.stdin(stdin.unwrap_or_else(Stdio::null));
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn()?;
        // Command 持有管道读端的副本，生成后立即释放，只留给子进程
        drop(cmd);

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_TAIL_LINES)));
        if let Some(stderr) = child.stderr.take() {
            forward_output(name.clone(), stderr, tail.clone());
        }
        if !pipe_stdout {
            if let Some(stdout) = child.stdout.take() {
                forward_output(name.clone(), stdout, tail.clone());
            }
        }

        debug!("Spawned {} (pid {:?}): {}", name, child.id(), program.display());
        Ok(Box::new(ChildProcess { name, child, tail }))
    }

    async fn kill_stale(&self, names: &[String]) {
        for name in names {
            let result = tokio::time::timeout(
                Duration::from_secs(5),
                Command::new("pkill")
                    .arg("-f")
                    .arg(name)
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .status(),
            )
            .await;
            match result {
                Ok(Ok(status)) => debug!("pkill -f {}: {}", name, status),
                Ok(Err(e)) => debug!("pkill -f {} failed: {}", name, e),
                Err(_) => debug!("pkill -f {} timed out", name),
            }
        }
    }
}

/// 子进程输出逐行写入日志，同时保留最近几行
///
/// 读端必须一直读到 EOF，否则子进程写输出时会收到 SIGPIPE
fn forward_output<R>(name: String, reader: R, tail: Arc<Mutex<VecDeque<String>>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("Failed to read output of {}: {}", name, e);
                    // 不再解析，只把剩余输出排空
                    let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                    break;
                }
            }

            // 非 UTF-8 输出按有损方式转换
            let line = String::from_utf8_lossy(&buf).trim_end().to_string();
            if line.is_empty() {
                continue;
            }
            debug!("[{}] {}", name, line);
            if let Ok(mut tail) = tail.lock() {
                if tail.len() == OUTPUT_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
    });
}

pub struct ChildProcess {
    name: String,
    child: Child,
    tail: Arc<Mutex<VecDeque<String>>>,
}

#[async_trait]
impl ManagedProcess for ChildProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    fn take_stdout(&mut self) -> Option<Stdio> {
        let stdout = self.child.stdout.take()?;
        match stdout.try_into() {
            Ok(stdio) => Some(stdio),
            Err(e) => {
                warn!("Failed to hand over stdout of {}: {}", self.name, e);
                None
            }
        }
    }

    fn terminate(&mut self) -> io::Result<()> {
        // 已回收的进程没有 pid
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from)
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn wait_timeout(&mut self, limit: Duration) -> io::Result<bool> {
        match tokio::time::timeout(limit, self.child.wait()).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(false),
        }
    }

    fn recent_output(&self) -> Vec<String> {
        self.tail
            .lock()
            .map(|tail| tail.iter().cloned().collect())
            .unwrap_or_default()
    }
}
