//! 资源准备
//!
//! 确保某个可执行资源存在于主安装目录、大小合法、可执行，并同步一份到 `bin/`
//! 以便执行器按名称查找。资源来源为随包文件或网络下载（带重试）。

use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::env::ProvisionSettings;
use crate::config::resources::{Artifact, LoadStrategy};
use crate::error::ProvisionError;
use crate::infra::RuntimeRoot;

/// 下载进度上报间隔
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// 一次下载任务
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub url: String,
    pub target_path: PathBuf,
    pub min_expected_size: u64,
    pub retries_remaining: u32,
    pub sha256: Option<String>,
}

/// 下载进度样本
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
    pub speed_kbps: f64,
}

/// 资源准备进度
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProvisionProgress {
    Download(DownloadProgress),
    /// 随包资源复制的粗粒度百分比
    Percent(u8),
}

pub type ProgressFn = dyn Fn(ProvisionProgress) + Send + Sync;

/// 不需要进度时使用
pub fn no_progress(_: ProvisionProgress) {}

/// 失败路径上删除临时文件
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

pub struct Provisioner {
    root: RuntimeRoot,
    http: reqwest::Client,
    max_retry: u32,
    retry_base: Duration,
}

impl Provisioner {
    pub fn new(root: RuntimeRoot, settings: &ProvisionSettings) -> Result<Self, ProvisionError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .read_timeout(Duration::from_secs(settings.read_timeout_secs))
            .build()?;

        Ok(Self {
            root,
            http,
            max_retry: settings.max_retry.max(1),
            retry_base: Duration::from_millis(settings.retry_base_ms),
        })
    }

    pub fn root(&self) -> &RuntimeRoot {
        &self.root
    }

    /// 主安装路径（不在 PATH 中）
    pub fn install_path(&self, name: &str) -> PathBuf {
        self.root.install_dir().join(name)
    }

    /// PATH 中的镜像路径
    pub fn mirror_path(&self, name: &str) -> PathBuf {
        self.root.bin_dir().join(name)
    }

    /// 确保资源已安装，返回主安装路径
    pub async fn ensure(
        &self,
        artifact: &Artifact,
        on_progress: &ProgressFn,
    ) -> Result<PathBuf, ProvisionError> {
        let installed = self.install_path(&artifact.name);

        match fs::metadata(&installed).await {
            Ok(meta) if meta.len() > artifact.min_size => {
                debug!(name = %artifact.name, size = meta.len(), "Artifact already installed");
                self.sync_mirror(&installed, &artifact.name).await?;
                return Ok(installed);
            }
            Ok(meta) => {
                warn!(
                    name = %artifact.name,
                    size = meta.len(),
                    min_size = artifact.min_size,
                    "Installed artifact too small, reinstalling"
                );
            }
            Err(_) => {}
        }

        info!(
            name = %artifact.name,
            strategy = %artifact.strategy,
            "Provisioning artifact"
        );

        match artifact.strategy {
            LoadStrategy::Assets => {
                self.copy_from_asset(&artifact.asset_path, &installed, on_progress)
                    .await?;
            }
            LoadStrategy::Network => {
                self.download(self.task_for(artifact, &installed), on_progress)
                    .await?;
            }
            LoadStrategy::Hybrid => {
                if let Err(e) = self
                    .copy_from_asset(&artifact.asset_path, &installed, on_progress)
                    .await
                {
                    warn!(name = %artifact.name, error = %e, "Bundled asset unavailable, downloading");
                    self.download(self.task_for(artifact, &installed), on_progress)
                        .await?;
                }
            }
        }

        set_executable(&installed).await?;
        self.sync_mirror(&installed, &artifact.name).await?;

        info!(name = %artifact.name, path = %installed.display(), "Artifact installed");
        Ok(installed)
    }

    fn task_for(&self, artifact: &Artifact, target: &Path) -> DownloadTask {
        DownloadTask {
            url: artifact.url.clone(),
            target_path: target.to_path_buf(),
            min_expected_size: artifact.min_size,
            retries_remaining: self.max_retry,
            sha256: artifact.sha256.clone(),
        }
    }

    /// 带重试的下载，第 n 次失败后等待 n × 基础延迟
    pub async fn download(
        &self,
        mut task: DownloadTask,
        on_progress: &ProgressFn,
    ) -> Result<u64, ProvisionError> {
        let mut attempt = 0u32;
        let mut last_error = String::from("no attempts made");

        while task.retries_remaining > 0 {
            attempt += 1;
            task.retries_remaining -= 1;

            match self.download_once(&task, on_progress).await {
                Ok(size) => {
                    info!(
                        url = %task.url,
                        size = %format_size(size),
                        attempt,
                        "Download completed"
                    );
                    return Ok(size);
                }
                Err(e) => {
                    warn!(url = %task.url, attempt, error = %e, "Download attempt failed");
                    last_error = e.to_string();
                    if task.retries_remaining > 0 {
                        sleep(self.retry_base * attempt).await;
                    }
                }
            }
        }

        Err(ProvisionError::Exhausted {
            attempts: attempt,
            last: last_error,
        })
    }

    async fn download_once(
        &self,
        task: &DownloadTask,
        on_progress: &ProgressFn,
    ) -> Result<u64, ProvisionError> {
        let target = &task.target_path;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = temp_path(target);
        let mut guard = TempFileGuard::new(tmp.clone());

        let mut response = self.http.get(&task.url).send().await?;
        if !response.status().is_success() {
            return Err(ProvisionError::BadStatus(response.status().as_u16()));
        }
        let total = response.content_length();

        let mut file = fs::File::create(&tmp).await?;
        let mut hasher = Sha256::new();
        let mut downloaded = 0u64;
        let mut last_sample = Instant::now();
        let mut last_bytes = 0u64;

        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            hasher.update(&chunk);
            downloaded += chunk.len() as u64;

            let elapsed = last_sample.elapsed();
            if elapsed >= PROGRESS_INTERVAL {
                let speed_kbps =
                    (downloaded - last_bytes) as f64 / elapsed.as_secs_f64() / 1024.0;
                debug!(
                    downloaded = %format_size(downloaded),
                    speed = %format_speed(speed_kbps),
                    "Download progress"
                );
                on_progress(ProvisionProgress::Download(DownloadProgress {
                    downloaded,
                    total,
                    speed_kbps,
                }));
                last_sample = Instant::now();
                last_bytes = downloaded;
            }
        }
        file.flush().await?;
        drop(file);

        on_progress(ProvisionProgress::Download(DownloadProgress {
            downloaded,
            total,
            speed_kbps: 0.0,
        }));

        if downloaded < task.min_expected_size {
            return Err(ProvisionError::TooSmall {
                actual: downloaded,
                expected: task.min_expected_size,
            });
        }

        if let Some(expected) = &task.sha256 {
            let actual = format!("{:x}", hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(ProvisionError::Checksum {
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        if fs::try_exists(target).await.unwrap_or(false) {
            fs::remove_file(target).await?;
        }
        fs::rename(&tmp, target).await?;
        guard.disarm();

        Ok(downloaded)
    }

    /// 从随包资源复制到目标路径
    pub async fn copy_from_asset(
        &self,
        asset: &Path,
        target: &Path,
        on_progress: &ProgressFn,
    ) -> Result<u64, ProvisionError> {
        if !fs::try_exists(asset).await.unwrap_or(false) {
            return Err(ProvisionError::AssetMissing(asset.to_path_buf()));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        on_progress(ProvisionProgress::Percent(60));

        let tmp = temp_path(target);
        let mut guard = TempFileGuard::new(tmp.clone());
        let size = fs::copy(asset, &tmp).await?;
        on_progress(ProvisionProgress::Percent(90));

        set_executable(&tmp).await?;
        fs::rename(&tmp, target).await?;
        guard.disarm();

        on_progress(ProvisionProgress::Percent(100));
        info!(
            asset = %asset.display(),
            size = %format_size(size),
            "Copied bundled asset"
        );
        Ok(size)
    }

    /// 同步 PATH 镜像：缺失或大小不同时复制
    async fn sync_mirror(&self, installed: &Path, name: &str) -> Result<(), ProvisionError> {
        let mirror = self.mirror_path(name);
        let source_len = fs::metadata(installed).await?.len();

        let up_to_date = match fs::metadata(&mirror).await {
            Ok(meta) => meta.len() == source_len,
            Err(_) => false,
        };
        if up_to_date {
            return Ok(());
        }

        if let Some(parent) = mirror.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = temp_path(&mirror);
        let mut guard = TempFileGuard::new(tmp.clone());
        fs::copy(installed, &tmp).await?;
        set_executable(&tmp).await?;
        fs::rename(&tmp, &mirror).await?;
        guard.disarm();

        debug!(name, mirror = %mirror.display(), "PATH mirror synced");
        Ok(())
    }
}

fn temp_path(target: &Path) -> PathBuf {
    let mut s = target.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

async fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

/// 格式化速度（KB/s）
pub fn format_speed(kbps: f64) -> String {
    if kbps >= 1024.0 {
        format!("{:.2} MB/s", kbps / 1024.0)
    } else {
        format!("{:.1} KB/s", kbps)
    }
}

/// 格式化字节数
pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    let b = bytes as f64;
    if b >= MB {
        format!("{:.2} MB", b / MB)
    } else if b >= KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use axum::{
        extract::State,
        http::StatusCode,
        response::{IntoResponse, Response},
        routing::get,
        Router,
    };

    const PAYLOAD_LEN: usize = 4096;

    fn settings(strategy: LoadStrategy, assets_dir: PathBuf) -> ProvisionSettings {
        ProvisionSettings {
            strategy,
            base_url: String::new(),
            assets_dir,
            connect_timeout_secs: 5,
            read_timeout_secs: 5,
            max_retry: 3,
            retry_base_ms: 10,
            frpc_sha256: None,
        }
    }

    async fn provisioner(dir: &tempfile::TempDir) -> Provisioner {
        let root = RuntimeRoot::new(dir.path().join("rt"));
        root.init().await.unwrap();
        Provisioner::new(root, &settings(LoadStrategy::Network, dir.path().join("assets")))
            .unwrap()
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn payload() -> Vec<u8> {
        (0..PAYLOAD_LEN).map(|i| (i % 251) as u8).collect()
    }

    async fn flaky(State(hits): State<Arc<AtomicUsize>>) -> Response {
        if hits.fetch_add(1, Ordering::SeqCst) < 2 {
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        } else {
            payload().into_response()
        }
    }

    async fn undersized(State(hits): State<Arc<AtomicUsize>>) -> Response {
        hits.fetch_add(1, Ordering::SeqCst);
        vec![1u8; 100].into_response()
    }

    fn artifact(url: String, asset_path: PathBuf, strategy: LoadStrategy) -> Artifact {
        Artifact {
            name: "frpc".to_string(),
            url,
            asset_path,
            min_size: 1024,
            sha256: None,
            strategy,
        }
    }

    #[tokio::test]
    async fn test_download_retries_after_server_errors() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(&dir).await;
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(Router::new().route("/bin", get(flaky)).with_state(hits.clone())).await;

        let target = dir.path().join("out/frpc");
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let size = p
            .download(
                DownloadTask {
                    url: format!("{}/bin", base),
                    target_path: target.clone(),
                    min_expected_size: 1024,
                    retries_remaining: 3,
                    sha256: None,
                },
                &move |e| sink.lock().unwrap().push(e),
            )
            .await
            .unwrap();

        assert_eq!(size, PAYLOAD_LEN as u64);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(std::fs::read(&target).unwrap(), payload());
        assert!(!temp_path(&target).exists());

        let last = *events.lock().unwrap().last().unwrap();
        match last {
            ProvisionProgress::Download(d) => {
                assert_eq!(d.downloaded, PAYLOAD_LEN as u64);
                assert_eq!(d.speed_kbps, 0.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_undersized_download_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(&dir).await;
        let hits = Arc::new(AtomicUsize::new(0));
        let base =
            serve(Router::new().route("/bin", get(undersized)).with_state(hits.clone())).await;

        let target = dir.path().join("out/frpc");
        let result = p
            .download(
                DownloadTask {
                    url: format!("{}/bin", base),
                    target_path: target.clone(),
                    min_expected_size: 1024,
                    retries_remaining: 3,
                    sha256: None,
                },
                &no_progress,
            )
            .await;

        assert!(matches!(
            result,
            Err(ProvisionError::Exhausted { attempts: 3, .. })
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(!target.exists());
        assert!(!temp_path(&target).exists());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(&dir).await;
        let hits = Arc::new(AtomicUsize::new(2));
        let base = serve(Router::new().route("/bin", get(flaky)).with_state(hits)).await;

        let target = dir.path().join("frpc");
        let result = p
            .download(
                DownloadTask {
                    url: format!("{}/bin", base),
                    target_path: target.clone(),
                    min_expected_size: 1,
                    retries_remaining: 1,
                    sha256: Some("00".repeat(32)),
                },
                &no_progress,
            )
            .await;

        match result {
            Err(ProvisionError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 1);
                assert!(last.contains("Checksum"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_ensure_from_assets_installs_and_mirrors() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(&dir).await;
        let asset = dir.path().join("assets/frpc-amd64");
        std::fs::create_dir_all(asset.parent().unwrap()).unwrap();
        std::fs::write(&asset, payload()).unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let installed = p
            .ensure(
                &artifact(String::new(), asset, LoadStrategy::Assets),
                &move |e| sink.lock().unwrap().push(e),
            )
            .await
            .unwrap();

        assert_eq!(installed, p.install_path("frpc"));
        assert_eq!(std::fs::read(&installed).unwrap(), payload());
        assert_eq!(std::fs::read(p.mirror_path("frpc")).unwrap(), payload());

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(p.mirror_path("frpc")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                ProvisionProgress::Percent(60),
                ProvisionProgress::Percent(90),
                ProvisionProgress::Percent(100)
            ]
        );
    }

    #[tokio::test]
    async fn test_ensure_existing_resyncs_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(&dir).await;
        std::fs::write(p.install_path("frpc"), payload()).unwrap();
        std::fs::write(p.mirror_path("frpc"), b"stale").unwrap();

        let missing_asset = dir.path().join("nope");
        p.ensure(&artifact(String::new(), missing_asset, LoadStrategy::Assets), &no_progress)
            .await
            .unwrap();

        assert_eq!(std::fs::read(p.mirror_path("frpc")).unwrap(), payload());
    }

    #[tokio::test]
    async fn test_hybrid_falls_back_to_download() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(&dir).await;
        let hits = Arc::new(AtomicUsize::new(2));
        let base = serve(Router::new().route("/bin", get(flaky)).with_state(hits)).await;

        let installed = p
            .ensure(
                &artifact(
                    format!("{}/bin", base),
                    dir.path().join("assets/missing"),
                    LoadStrategy::Hybrid,
                ),
                &no_progress,
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(installed).unwrap(), payload());
        assert!(p.mirror_path("frpc").exists());
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(10 * 1024 * 1024), "10.00 MB");
        assert_eq!(format_speed(512.0), "512.0 KB/s");
        assert_eq!(format_speed(2048.0), "2.00 MB/s");
    }
}
