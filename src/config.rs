use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// 推流配置，启动时加载，之后只读
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// 分辨率，格式为 "WIDTHxHEIGHT"
    pub resolution: String,
    pub fps: u32,
    pub hostname: String,
    pub port: u16,
    /// RTSP 路径段，例如 "stream"
    pub path: String,
    /// 码率 (bits/sec)
    pub bitrate: u32,
    /// 关键帧间隔 (帧)
    pub keyframe_interval: u32,
    pub profile: String,
    pub level: String,

    /// 采集方式: 外部管道 或 MediaMTX 内建摄像头
    pub mode: CaptureMode,
    pub binaries: BinaryPaths,
    pub supervisor: SupervisorPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// rpicam-vid | ffmpeg -> mediamtx
    #[default]
    Pipe,
    /// mediamtx 直接驱动摄像头
    Native,
}

/// 可执行文件路径覆盖，留空则自动查找
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinaryPaths {
    pub server: String,
    pub capture: String,
    pub relay: String,
}

impl Default for BinaryPaths {
    fn default() -> Self {
        Self {
            server: "mediamtx".to_string(),
            capture: "rpicam-vid".to_string(),
            relay: "ffmpeg".to_string(),
        }
    }
}

/// 进程监控的时间策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorPolicy {
    pub port_poll_interval_ms: u64,
    pub port_timeout_ms: u64,
    pub monitor_interval_ms: u64,
    pub stop_timeout_ms: u64,
    pub settle_delay_ms: u64,
    pub capture_grace_ms: u64,
    /// 启动前清理系统中残留的同名进程
    pub kill_stale: bool,
    /// 可用内存下限 (KB)，0 表示不检查
    pub min_free_memory_kb: u64,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            port_poll_interval_ms: 200,
            port_timeout_ms: 10_000,
            monitor_interval_ms: 1_000,
            stop_timeout_ms: 5_000,
            settle_delay_ms: 500,
            capture_grace_ms: 2_000,
            kill_stale: true,
            min_free_memory_kb: 5120,
        }
    }
}

impl SupervisorPolicy {
    pub fn port_poll_interval(&self) -> Duration {
        Duration::from_millis(self.port_poll_interval_ms)
    }

    pub fn port_timeout(&self) -> Duration {
        Duration::from_millis(self.port_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn capture_grace(&self) -> Duration {
        Duration::from_millis(self.capture_grace_ms)
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            resolution: "1280x720".to_string(),
            fps: 30,
            hostname: "0.0.0.0".to_string(),
            port: 8554,
            path: "stream".to_string(),
            bitrate: 2_000_000,
            keyframe_interval: 15,
            profile: "baseline".to_string(),
            level: "4.1".to_string(),
            mode: CaptureMode::default(),
            binaries: BinaryPaths::default(),
            supervisor: SupervisorPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

impl FromStr for Resolution {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .with_context(|| format!("resolution '{}' is not in WIDTHxHEIGHT form", s))?;
        let width: u32 = w
            .trim()
            .parse()
            .with_context(|| format!("invalid width in resolution '{}'", s))?;
        let height: u32 = h
            .trim()
            .parse()
            .with_context(|| format!("invalid height in resolution '{}'", s))?;
        if width == 0 || height == 0 {
            bail!("resolution '{}' must have positive dimensions", s);
        }
        Ok(Self { width, height })
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl StreamSettings {
    /// 加载配置文件；文件不存在时写入默认配置后返回
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let settings = Self::default();
            settings.save(path)?;
            info!("Created default config at {}", path.display());
            return Ok(settings);
        }
        Self::load(path)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let settings: Self = if is_yaml(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("malformed config {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("malformed config {}", path.display()))?
        };
        settings
            .validate()
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(settings)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let content = if is_yaml(path) {
            serde_yaml::to_string(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };
        std::fs::write(path, content)
            .with_context(|| format!("failed to write config {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.resolution()?;
        if self.port == 0 {
            bail!("port must be between 1 and 65535");
        }
        if self.fps == 0 {
            bail!("fps must be positive");
        }
        if self.bitrate == 0 {
            bail!("bitrate must be positive");
        }
        if self.keyframe_interval == 0 {
            bail!("keyframe_interval must be positive");
        }
        if self.path.is_empty() || self.path.contains('/') {
            bail!("path '{}' must be a single non-empty segment", self.path);
        }
        if self.supervisor.port_poll_interval_ms == 0 || self.supervisor.monitor_interval_ms == 0 {
            bail!("supervisor poll intervals must be positive");
        }
        Ok(())
    }

    pub fn resolution(&self) -> anyhow::Result<Resolution> {
        self.resolution.parse()
    }

    pub fn rtsp_url(&self) -> String {
        format!("rtsp://{}:{}/{}", self.hostname, self.port, self.path)
    }

    /// 服务端监听地址，通配地址只保留端口
    pub fn bind_address(&self) -> String {
        match self.hostname.as_str() {
            "" | "0.0.0.0" | "::" | "[::]" => format!(":{}", self.port),
            host => format!("{}:{}", host, self.port),
        }
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// 默认配置路径: ~/Desktop/stream.json
pub fn default_config_path() -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join("Desktop").join("stream.json")
}
