use crate::config::{CaptureMode, StreamSettings};
use crate::error::StartError;
use crate::locator::Locator;
use crate::process::LaunchSpec;
use std::path::{Path, PathBuf};

/// 按依赖顺序排列的启动计划
#[derive(Debug)]
pub struct LaunchPlan {
    pub server: LaunchSpec,
    /// 外部采集链路，native 模式下为空
    pub chain: Option<CaptureChain>,
    /// 启动前需要清理的进程名
    pub stale_names: Vec<String>,
}

/// 采集进程的标准输出接到转发进程的标准输入
#[derive(Debug)]
pub struct CaptureChain {
    pub capture: LaunchSpec,
    pub relay: LaunchSpec,
}

impl LaunchPlan {
    /// 查找所需的可执行文件并生成各进程的参数和环境变量
    ///
    /// # 错误处理
    /// - 任一可执行文件找不到时返回 `StartError::BinaryNotFound`
    pub fn build(settings: &StreamSettings, locator: &Locator) -> Result<Self, StartError> {
        let binaries = &settings.binaries;
        let server_path = resolve(locator, &binaries.server)?;

        let (server, chain, stale_names) = match settings.mode {
            CaptureMode::Pipe => {
                let capture_path = resolve(locator, &binaries.capture)?;
                let relay_path = resolve(locator, &binaries.relay)?;
                let chain = CaptureChain {
                    capture: capture_spec(settings, capture_path),
                    relay: relay_spec(settings, relay_path),
                };
                (
                    server_spec(settings, server_path),
                    Some(chain),
                    vec![program_name(&binaries.server), program_name(&binaries.capture)],
                )
            }
            CaptureMode::Native => (
                native_server_spec(settings, server_path),
                None,
                vec![program_name(&binaries.server)],
            ),
        };

        Ok(Self {
            server,
            chain,
            stale_names,
        })
    }
}

fn resolve(locator: &Locator, program: &str) -> Result<PathBuf, StartError> {
    locator
        .locate(program)
        .ok_or_else(|| StartError::BinaryNotFound(program.to_string()))
}

fn program_name(program: &str) -> String {
    Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string())
}

/// MediaMTX，只负责 RTSP 服务
pub fn server_spec(settings: &StreamSettings, program: PathBuf) -> LaunchSpec {
    LaunchSpec::new(program_name(&settings.binaries.server), program)
        .env("MTX_PROTOCOLS", "tcp")
        .env("MTX_RTSPADDRESS", settings.bind_address())
}

/// MediaMTX 使用内建的 rpiCamera 源
///
/// 摄像头参数按路径名 (大写) 写入环境变量
pub fn native_server_spec(settings: &StreamSettings, program: PathBuf) -> LaunchSpec {
    let key = path_env_key(&settings.path);
    let prefix = format!("MTX_PATHS_{}", key);
    // 配置已校验，解析失败时退回默认分辨率
    let res = settings.resolution().unwrap_or_default();

    server_spec(settings, program)
        .env(format!("{}_SOURCE", prefix), "rpiCamera")
        .env(format!("{}_RPICAMERAWIDTH", prefix), res.width.to_string())
        .env(format!("{}_RPICAMERAHEIGHT", prefix), res.height.to_string())
        .env(format!("{}_RPICAMERAFPS", prefix), settings.fps.to_string())
        .env(
            format!("{}_RPICAMERAIDRPERIOD", prefix),
            settings.keyframe_interval.to_string(),
        )
        .env(format!("{}_RPICAMERAPROFILE", prefix), settings.profile.clone())
        .env(format!("{}_RPICAMERALEVEL", prefix), settings.level.clone())
        .env(format!("{}_RPICAMERABITRATE", prefix), settings.bitrate.to_string())
}

/// rpicam-vid 输出裸 H.264 到标准输出
pub fn capture_spec(settings: &StreamSettings, program: PathBuf) -> LaunchSpec {
    let res = settings.resolution().unwrap_or_default();

    let spec = LaunchSpec::new(program_name(&settings.binaries.capture), program).args([
        "-t".to_string(),
        "0".to_string(),
        "-n".to_string(),
        "--width".to_string(),
        res.width.to_string(),
        "--height".to_string(),
        res.height.to_string(),
        "--framerate".to_string(),
        settings.fps.to_string(),
        "--codec".to_string(),
        "h264".to_string(),
        "--libav-format".to_string(),
        "h264".to_string(),
        "--profile".to_string(),
        settings.profile.clone(),
        "--level".to_string(),
        settings.level.clone(),
        "--intra".to_string(),
        settings.keyframe_interval.to_string(),
        "--bitrate".to_string(),
        settings.bitrate.to_string(),
        // 每个 IDR 帧前插入 SPS/PPS
        "--inline".to_string(),
        "-o".to_string(),
        "-".to_string(),
    ]);
    LaunchSpec {
        pipe_stdout: true,
        ..spec
    }
}

/// ffmpeg 从标准输入读取 H.264，不重新编码，推送到本地 RTSP 服务
pub fn relay_spec(settings: &StreamSettings, program: PathBuf) -> LaunchSpec {
    LaunchSpec::new(program_name(&settings.binaries.relay), program).args([
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "warning".to_string(),
        "-f".to_string(),
        "h264".to_string(),
        "-i".to_string(),
        "-".to_string(),
        "-c:v".to_string(),
        "copy".to_string(),
        "-f".to_string(),
        "rtsp".to_string(),
        "-rtsp_transport".to_string(),
        "tcp".to_string(),
        publish_url(settings),
    ])
}

/// 转发进程推流的本地地址
pub fn publish_url(settings: &StreamSettings) -> String {
    format!("rtsp://127.0.0.1:{}/{}", settings.port, settings.path)
}

fn path_env_key(path: &str) -> String {
    path.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
