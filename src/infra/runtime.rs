//! 运行时根目录
//!
//! 所有子进程都在这个私有前缀下运行：
//!
//! ```text
//! <root>/bin          PATH 中的程序
//! <root>/lib          LD_LIBRARY_PATH
//! <root>/home         工作目录 / HOME
//! <root>/home/.agent  主安装目录（不在 PATH 中）
//! <root>/tmp          TMPDIR
//! <root>/run          pid 文件与停止标记
//! ```

use std::path::{Path, PathBuf};

/// 追加在运行时 bin 目录之后的系统路径
const SYSTEM_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeRoot {
    root: PathBuf,
}

impl RuntimeRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// 创建目录结构（可重复调用）
    pub async fn init(&self) -> std::io::Result<()> {
        for dir in [
            self.bin_dir(),
            self.lib_dir(),
            self.install_dir(),
            self.tmp_dir(),
            self.run_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.bin_dir().is_dir() && self.home_dir().is_dir()
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn lib_dir(&self) -> PathBuf {
        self.root.join("lib")
    }

    pub fn home_dir(&self) -> PathBuf {
        self.root.join("home")
    }

    /// 主安装目录
    pub fn install_dir(&self) -> PathBuf {
        self.home_dir().join(".agent")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    /// 子进程使用的完整环境变量
    pub fn env(&self) -> Vec<(String, String)> {
        let bin = self.bin_dir().to_string_lossy().to_string();
        vec![
            ("HOME".to_string(), self.home_dir().to_string_lossy().to_string()),
            ("PREFIX".to_string(), self.root.to_string_lossy().to_string()),
            ("TMPDIR".to_string(), self.tmp_dir().to_string_lossy().to_string()),
            ("PATH".to_string(), format!("{}:{}", bin, SYSTEM_PATH)),
            (
                "LD_LIBRARY_PATH".to_string(),
                self.lib_dir().to_string_lossy().to_string(),
            ),
            ("LANG".to_string(), "C.UTF-8".to_string()),
        ]
    }
}
