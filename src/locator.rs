use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// 可执行文件查找器
///
/// 查找顺序：
/// - 当前程序所在目录
/// - 系统目录 (/usr/local/bin, /usr/bin)
/// - 用户目录下的安装目录 (~/<name>/<name>)
/// - PATH 中的每个目录
///
/// 第一个存在且可执行的候选即为结果
#[derive(Debug, Clone, Default)]
pub struct Locator {
    pub bundle_dir: Option<PathBuf>,
    pub system_dirs: Vec<PathBuf>,
    pub home_dir: Option<PathBuf>,
    pub search_path: Option<OsString>,
}

impl Locator {
    /// 按当前运行环境构造
    pub fn from_env() -> Self {
        let bundle_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        Self {
            bundle_dir,
            system_dirs: vec![PathBuf::from("/usr/local/bin"), PathBuf::from("/usr/bin")],
            home_dir: std::env::var_os("HOME").map(PathBuf::from),
            search_path: std::env::var_os("PATH"),
        }
    }

    /// 固定顺序的候选路径 (不含 PATH)
    pub fn candidates(&self, name: &str) -> Vec<PathBuf> {
        let mut out = Vec::new();
        if let Some(dir) = &self.bundle_dir {
            out.push(dir.join(name));
        }
        for dir in &self.system_dirs {
            out.push(dir.join(name));
        }
        if let Some(home) = &self.home_dir {
            out.push(home.join(name).join(name));
        }
        out
    }

    pub fn locate(&self, program: &str) -> Option<PathBuf> {
        if program.is_empty() {
            return None;
        }

        // 显式路径只检查自身
        if program.contains('/') {
            let path = PathBuf::from(program);
            return is_executable(&path).then_some(path);
        }

        if let Some(found) = self.candidates(program).into_iter().find(|p| is_executable(p)) {
            return Some(found);
        }

        let search_path = self.search_path.as_ref()?;
        std::env::split_paths(search_path)
            .map(|dir| dir.join(program))
            .find(|p| is_executable(p))
    }
}

fn is_executable(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}
