//! 命令执行器
//!
//! 所有子进程都经由同一个 spawn 入口启动：
//! - 合成环境变量（HOME/PREFIX/TMPDIR/PATH/LD_LIBRARY_PATH 指向运行时根目录）
//! - 通过 PATH 查找程序，不使用绝对路径
//! - 独立进程组，超时或停止时整组发送信号
//! - stdout/stderr 持续读取，避免管道写满阻塞子进程

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::runtime::RuntimeRoot;

/// 进程退出后读取任务的最长等待时间
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// `destroy` 中 SIGTERM 与 SIGKILL 之间的等待时间
const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(3);

/// 命令执行错误
#[derive(Debug)]
pub enum CommandError {
    /// 运行时根目录尚未初始化
    NotInitialized(std::path::PathBuf),
    /// 命令启动失败
    SpawnFailed(std::io::Error),
    /// 子进程没有可用的输出管道
    MissingPipe(&'static str),
    /// 命令超时（已强制结束）
    TimedOut(Duration),
    /// 等待命令完成失败
    WaitFailed(std::io::Error),
    /// 进程仍在运行，没有退出码
    StillRunning,
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::NotInitialized(p) => {
                write!(f, "Runtime root not initialized: {}", p.display())
            }
            CommandError::SpawnFailed(e) => write!(f, "Failed to spawn command: {}", e),
            CommandError::MissingPipe(which) => write!(f, "Child has no {} pipe", which),
            CommandError::TimedOut(t) => write!(f, "Command timed out after {:?}", t),
            CommandError::WaitFailed(e) => write!(f, "Failed to wait for command: {}", e),
            CommandError::StillRunning => write!(f, "Process is still running"),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::SpawnFailed(e) | CommandError::WaitFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// 阻塞执行的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    /// stdout 与 stderr 按到达顺序合并
    pub output: String,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// 命令执行器
#[derive(Clone, Debug)]
pub struct Executor {
    root: RuntimeRoot,
    kill_grace: Duration,
}

impl Executor {
    pub fn new(root: RuntimeRoot) -> Self {
        Self {
            root,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn root(&self) -> &RuntimeRoot {
        &self.root
    }

    /// 通过 `sh -c` 执行命令并等待结束
    pub async fn execute(
        &self,
        command: &str,
        working_dir: Option<&Path>,
        timeout: Duration,
    ) -> Result<ExecutionResult, CommandError> {
        let cmd = self.build("sh", &["-c", command], working_dir)?;
        self.run(cmd, timeout).await
    }

    /// 不经过 shell 直接执行程序
    pub async fn execute_direct(
        &self,
        program: &str,
        args: &[&str],
        working_dir: Option<&Path>,
        timeout: Duration,
    ) -> Result<ExecutionResult, CommandError> {
        let cmd = self.build(program, args, working_dir)?;
        self.run(cmd, timeout).await
    }

    /// 通过 `sh -c` 启动后台进程，立即返回句柄
    pub async fn start_background(
        &self,
        command: &str,
        working_dir: Option<&Path>,
    ) -> Result<ProcessHandle, CommandError> {
        let cmd = self.build("sh", &["-c", command], working_dir)?;
        self.spawn_handle(cmd)
    }

    /// 不经过 shell 启动后台进程
    pub async fn start_background_direct(
        &self,
        program: &str,
        args: &[&str],
        working_dir: Option<&Path>,
    ) -> Result<ProcessHandle, CommandError> {
        let cmd = self.build(program, args, working_dir)?;
        self.spawn_handle(cmd)
    }

    /// 检查命令是否可以在 PATH 中找到
    pub async fn command_available(&self, name: &str) -> bool {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return false;
        }

        match self
            .execute(&format!("command -v {}", name), None, Duration::from_secs(5))
            .await
        {
            Ok(result) => result.success() && !result.output.trim().is_empty(),
            Err(e) => {
                debug!(command = name, error = %e, "command -v failed");
                false
            }
        }
    }

    fn build(
        &self,
        program: &str,
        args: &[&str],
        working_dir: Option<&Path>,
    ) -> Result<Command, CommandError> {
        if !self.root.is_initialized() {
            return Err(CommandError::NotInitialized(self.root.path().to_path_buf()));
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(self.root.env())
            .current_dir(
                working_dir
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| self.root.home_dir()),
            )
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        Ok(cmd)
    }

    fn spawn_handle(&self, mut cmd: Command) -> Result<ProcessHandle, CommandError> {
        let mut child = cmd.spawn().map_err(CommandError::SpawnFailed)?;
        let Some(pid) = child.id() else {
            return Err(CommandError::MissingPipe("pid"));
        };

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => (out, err),
            (out, _) => {
                let _ = signal_group(pid, libc::SIGKILL);
                let _ = child.start_kill();
                return Err(CommandError::MissingPipe(if out.is_none() {
                    "stdout"
                } else {
                    "stderr"
                }));
            }
        };

        debug!(pid, "Background process started");
        Ok(ProcessHandle {
            pid,
            child,
            stdout: Some(stdout),
            stderr: Some(stderr),
            exit_code: None,
            destroyed: false,
            kill_grace: self.kill_grace,
        })
    }

    async fn run(&self, cmd: Command, timeout: Duration) -> Result<ExecutionResult, CommandError> {
        let mut handle = self.spawn_handle(cmd)?;
        let pid = handle.pid;

        let sink = Arc::new(Mutex::new(String::new()));
        let readers = [
            spawn_collector(handle.stdout.take(), "stdout", sink.clone()),
            spawn_collector(handle.stderr.take(), "stderr", sink.clone()),
        ];

        match tokio::time::timeout(timeout, handle.child.wait()).await {
            Ok(Ok(status)) => {
                for reader in readers {
                    join_reader(reader).await;
                }
                let output = sink
                    .lock()
                    .map(|buf| buf.trim_end_matches('\n').to_string())
                    .unwrap_or_default();
                Ok(ExecutionResult {
                    exit_code: exit_code_of(status),
                    output,
                })
            }
            Ok(Err(e)) => {
                for reader in readers {
                    reader.abort();
                }
                Err(CommandError::WaitFailed(e))
            }
            Err(_) => {
                warn!(pid, ?timeout, "Command timed out, killing process group");
                if let Err(e) = signal_group(pid, libc::SIGKILL) {
                    debug!(pid, error = %e, "SIGKILL to process group failed");
                }
                let _ = handle.child.start_kill();
                for reader in readers {
                    reader.abort();
                }
                let _ = handle.child.wait().await;
                Err(CommandError::TimedOut(timeout))
            }
        }
    }
}

fn spawn_collector<R>(
    stream: Option<R>,
    tag: &'static str,
    sink: Arc<Mutex<String>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(stream) = stream else {
            return;
        };
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                trace!(stream = tag, "<empty line>");
            } else {
                trace!(stream = tag, line = %line);
            }
            if let Ok(mut buf) = sink.lock() {
                buf.push_str(&line);
                buf.push('\n');
            }
        }
    })
}

async fn join_reader(reader: JoinHandle<()>) {
    let abort = reader.abort_handle();
    if tokio::time::timeout(READER_JOIN_TIMEOUT, reader).await.is_err() {
        // 孙进程仍持有管道
        abort.abort();
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// 后台进程句柄
///
/// 由启动它的组件独占，`destroy` 只生效一次。
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    exit_code: Option<i32>,
    destroyed: bool,
    kill_grace: Duration,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// 等待进程结束（结果会缓存）
    pub async fn wait(&mut self) -> Result<i32, CommandError> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let status = self.child.wait().await.map_err(CommandError::WaitFailed)?;
        let code = exit_code_of(status);
        self.exit_code = Some(code);
        Ok(code)
    }

    /// 非破坏性存活探测
    pub fn is_alive(&mut self) -> bool {
        if self.exit_code.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = Some(exit_code_of(status));
                false
            }
            Ok(None) => pid_exists(self.pid),
            Err(_) => pid_exists(self.pid),
        }
    }

    pub fn exit_value(&mut self) -> Result<i32, CommandError> {
        if self.is_alive() {
            return Err(CommandError::StillRunning);
        }
        Ok(self.exit_code.unwrap_or(-1))
    }

    /// 终止进程组并回收（可重复调用）
    pub async fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        self.stdout = None;
        self.stderr = None;

        if !self.is_alive() {
            return;
        }

        if let Err(e) = signal_group(self.pid, libc::SIGTERM) {
            debug!(pid = self.pid, error = %e, "SIGTERM to process group failed");
        }

        match tokio::time::timeout(self.kill_grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit_code = Some(exit_code_of(status));
            }
            _ => {
                warn!(pid = self.pid, "Process ignored SIGTERM, sending SIGKILL");
                let _ = signal_group(self.pid, libc::SIGKILL);
                let _ = self.child.start_kill();
                if let Ok(status) = self.child.wait().await {
                    self.exit_code = Some(exit_code_of(status));
                }
            }
        }
    }
}

/// 单引号包裹，用于拼接 `sh -c` 命令
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// 向进程组发送信号
pub fn signal_group(pgid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let Ok(pgid) = i32::try_from(pgid) else {
        return Err(std::io::Error::from(std::io::ErrorKind::InvalidInput));
    };
    if pgid <= 0 {
        return Err(std::io::Error::from(std::io::ErrorKind::InvalidInput));
    }
    // SAFETY: kill(2) 只读取参数，负数 pid 表示整个进程组。
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(-pgid, signal) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// 向单个进程发送信号
pub fn signal_pid(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let Ok(pid) = i32::try_from(pid) else {
        return Err(std::io::Error::from(std::io::ErrorKind::InvalidInput));
    };
    if pid <= 0 {
        return Err(std::io::Error::from(std::io::ErrorKind::InvalidInput));
    }
    // SAFETY: 同上。
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(pid, signal) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// signal 0 探测进程是否存在，僵尸进程视为已退出
pub fn pid_exists(pid: u32) -> bool {
    match signal_pid(pid, 0) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EPERM) => return true,
        Err(_) => return false,
    }

    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(')')
            .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
            .unwrap_or(true),
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    async fn executor() -> (tempfile::TempDir, Executor) {
        let dir = tempfile::tempdir().unwrap();
        let root = RuntimeRoot::new(dir.path().join("rt"));
        root.init().await.unwrap();
        let exec = Executor::new(root).with_kill_grace(Duration::from_millis(500));
        (dir, exec)
    }

    #[tokio::test]
    async fn test_execute_collects_output() {
        let (_dir, exec) = executor().await;
        let result = exec
            .execute("echo hello; echo oops >&2", None, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(result.success());
        assert!(result.output.contains("hello"));
        assert!(result.output.contains("oops"));
    }

    #[tokio::test]
    async fn test_execute_exit_code() {
        let (_dir, exec) = executor().await;
        let result = exec.execute("exit 3", None, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_environment_points_into_root() {
        let (_dir, exec) = executor().await;
        let result = exec
            .execute("echo \"$HOME|$PATH\"; pwd", None, Duration::from_secs(5))
            .await
            .unwrap();

        let home = exec.root().home_dir().to_string_lossy().to_string();
        let bin = exec.root().bin_dir().to_string_lossy().to_string();
        assert!(result.output.contains(&format!("{}|{}:", home, bin)));
        assert!(result.output.lines().last().unwrap().ends_with("home"));
    }

    #[tokio::test]
    async fn test_not_initialized_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Executor::new(RuntimeRoot::new(dir.path().join("missing")));
        let result = exec.execute("true", None, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(CommandError::NotInitialized(_))));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let (dir, exec) = executor().await;
        let pid_file = dir.path().join("pid");
        let cmd = format!("echo $$ > {}; exec sleep 30", pid_file.display());

        let result = exec.execute(&cmd, None, Duration::from_millis(300)).await;
        assert!(matches!(result, Err(CommandError::TimedOut(_))));

        let pid: u32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        assert!(!pid_exists(pid));
    }

    #[tokio::test]
    async fn test_execute_direct_uses_path_lookup() {
        let (_dir, exec) = executor().await;
        let tool = exec.root().bin_dir().join("hello-tool");
        std::fs::write(&tool, "#!/bin/sh\necho \"tool:$1\"\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let result = exec
            .execute_direct("hello-tool", &["x"], None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.output, "tool:x");

        assert!(exec.command_available("hello-tool").await);
        assert!(!exec.command_available("no-such-tool-4821").await);
        assert!(!exec.command_available("sh; rm -rf /").await);
    }

    #[tokio::test]
    async fn test_background_handle_lifecycle() {
        let (_dir, exec) = executor().await;
        let mut handle = exec.start_background("exec sleep 30", None).await.unwrap();
        let pid = handle.pid();

        assert!(handle.is_alive());
        assert!(matches!(handle.exit_value(), Err(CommandError::StillRunning)));

        handle.destroy().await;
        assert!(!handle.is_alive());
        assert!(!pid_exists(pid));
        assert!(handle.exit_value().is_ok());

        // 第二次 destroy 为空操作
        handle.destroy().await;
    }

    #[tokio::test]
    async fn test_background_direct_reads_stdout() {
        use tokio::io::AsyncReadExt;

        let (_dir, exec) = executor().await;
        let mut handle = exec
            .start_background_direct("echo", &["direct"], None)
            .await
            .unwrap();

        let mut out = String::new();
        handle
            .take_stdout()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(out.trim(), "direct");
        assert_eq!(handle.wait().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_wait_is_memoized() {
        let (_dir, exec) = executor().await;
        let mut handle = exec.start_background("exit 7", None).await.unwrap();
        assert_eq!(handle.wait().await.unwrap(), 7);
        assert_eq!(handle.wait().await.unwrap(), 7);
        assert_eq!(handle.exit_value().unwrap(), 7);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/tmp/a b"), "'/tmp/a b'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[tokio::test]
    async fn test_destroy_escalates_to_sigkill() {
        let (_dir, exec) = executor().await;
        let mut handle = exec
            .start_background("trap '' TERM; while true; do sleep 0.1; done", None)
            .await
            .unwrap();
        let pid = handle.pid();
        tokio::time::sleep(Duration::from_millis(100)).await;

        handle.destroy().await;
        assert!(!pid_exists(pid));
    }
}
