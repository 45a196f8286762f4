//! 单个 profile 的连通性探测
//!
//! 三种探测器：
//! - [`DisposableCoreProber`]：为每个 profile 生成测速配置，拉起一次性 core，
//!   经它的本地 mixed 入站请求测试 URL，结束后关掉 core
//! - [`BatchCoreProber`]：整批 profile 共用一个 core，每个 profile 一个本地入站
//! - [`SharedCoreProber`]：经正在运行的 core 请求，只能测当前运行的 profile
//! - [`TcpPingProber`]：直接 TCP 连接服务器地址

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use super::supervisor::{CoreState, CoreSupervisor};
use crate::builder::ConfigGenerator;
use crate::common::net::free_local_port;
use crate::config::types::CoreSettings;
use crate::model::{Profile, ProfileId, TestErrorKind};
use crate::store::ProfileRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeMode {
    #[default]
    UrlTest,
    /// 整批共用一个 core，启动开销只有一次
    BatchUrlTest,
    TcpPing,
}

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Error)]
#[error("{}: {message}", .kind.as_str())]
pub struct ProbeError {
    pub kind: TestErrorKind,
    pub message: String,
}

impl ProbeError {
    pub fn new(kind: TestErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Prober: Send + Sync {
    /// 探测一次，返回延迟。`abandon` 触发时应尽快放弃
    async fn probe(
        &self,
        profile: &Profile,
        options: &ProbeOptions,
        abandon: &CancellationToken,
    ) -> Result<Duration, ProbeError>;

    /// 单次探测的总时限，超时记为 TIMEOUT
    fn deadline(&self, options: &ProbeOptions) -> Duration {
        options.timeout
    }
}

fn classify(err: &reqwest::Error) -> TestErrorKind {
    if err.is_timeout() {
        return TestErrorKind::Timeout;
    }
    let mut chain = String::new();
    let mut source = Some(err as &dyn std::error::Error);
    while let Some(e) = source {
        chain.push_str(&e.to_string().to_ascii_lowercase());
        chain.push(' ');
        source = e.source();
    }
    if chain.contains("certificate") || chain.contains("tls") || chain.contains("handshake") {
        TestErrorKind::Tls
    } else if err.is_connect() || chain.contains("refused") || chain.contains("reset") {
        TestErrorKind::Connect
    } else {
        TestErrorKind::Other
    }
}

/// 经本地 socks 代理请求 `url`，计时到收到响应头
pub async fn url_test(
    proxy: &str,
    options: &ProbeOptions,
    abandon: &CancellationToken,
) -> Result<Duration, ProbeError> {
    let proxy = reqwest::Proxy::all(proxy)
        .map_err(|e| ProbeError::new(TestErrorKind::Config, format!("bad proxy {proxy}: {e}")))?;
    let client = reqwest::Client::builder()
        .proxy(proxy)
        .timeout(options.timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| ProbeError::new(TestErrorKind::Other, e.to_string()))?;

    let started = Instant::now();
    let response = tokio::select! {
        _ = abandon.cancelled() => {
            return Err(ProbeError::new(TestErrorKind::Cancelled, "abandoned"));
        }
        r = client.get(&options.url).send() => r,
    };
    match response {
        Ok(_) => Ok(started.elapsed()),
        Err(e) => Err(ProbeError::new(classify(&e), e.to_string())),
    }
}

/// 每次探测拉起一个独立的 core
pub struct DisposableCoreProber {
    generator: Arc<ConfigGenerator>,
    registry: Arc<ProfileRegistry>,
    core: CoreSettings,
    work_dir: PathBuf,
}

impl DisposableCoreProber {
    pub fn new(
        generator: Arc<ConfigGenerator>,
        registry: Arc<ProfileRegistry>,
        mut core: CoreSettings,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        // 测速 core 崩溃即失败，不自动重启
        core.crash_threshold = 1;
        Self {
            generator,
            registry,
            core,
            work_dir: work_dir.into(),
        }
    }
}

/// 探测结束或被丢弃时关掉一次性 core 并删除其配置
struct DisposableCore {
    supervisor: CoreSupervisor,
}

impl Drop for DisposableCore {
    fn drop(&mut self) {
        let supervisor = self.supervisor.clone();
        let cleanup = async move {
            if supervisor.state().is_active() {
                if let Err(e) = supervisor.stop().await {
                    tracing::debug!(error = %e, "probe core stop failed");
                }
            }
            let _ = tokio::fs::remove_file(supervisor.config_path()).await;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(cleanup);
        }
    }
}

#[async_trait]
impl Prober for DisposableCoreProber {
    async fn probe(
        &self,
        profile: &Profile,
        options: &ProbeOptions,
        abandon: &CancellationToken,
    ) -> Result<Duration, ProbeError> {
        let port = free_local_port()
            .map_err(|e| ProbeError::new(TestErrorKind::Other, format!("no free port: {e}")))?;
        let doc = {
            let snapshot = self.registry.snapshot();
            self.generator
                .generate_test(&*snapshot, profile, port)
                .map_err(|e| ProbeError::new(TestErrorKind::Config, e.to_string()))?
        };

        let config_path = self.work_dir.join(format!("probe-{}-{port}.json", profile.id));
        let core = DisposableCore {
            supervisor: CoreSupervisor::new(self.core.clone(), config_path),
        };
        tokio::select! {
            _ = abandon.cancelled() => {
                return Err(ProbeError::new(TestErrorKind::Cancelled, "abandoned"));
            }
            r = core.supervisor.start(doc) => {
                r.map_err(|e| ProbeError::new(TestErrorKind::Other, e.to_string()))?;
            }
        }

        let result = url_test(&format!("socks5h://127.0.0.1:{port}"), options, abandon).await;
        if core.supervisor.state() == CoreState::CrashLoop {
            return Err(ProbeError::new(TestErrorKind::Other, "probe core exited during test"));
        }
        result
    }

    fn deadline(&self, options: &ProbeOptions) -> Duration {
        options.timeout + self.core.ready_timeout()
    }
}

/// 整批 profile 共用的 core：第一次探测时生成批量配置并启动，
/// prober 释放时关掉
pub struct BatchCoreProber {
    generator: Arc<ConfigGenerator>,
    registry: Arc<ProfileRegistry>,
    core: CoreSettings,
    work_dir: PathBuf,
    profiles: Vec<Profile>,
    batch: OnceCell<Result<BatchCore, ProbeError>>,
}

struct BatchCore {
    core: DisposableCore,
    ports: BTreeMap<ProfileId, u16>,
    skipped: BTreeMap<ProfileId, String>,
}

impl BatchCoreProber {
    pub fn new(
        generator: Arc<ConfigGenerator>,
        registry: Arc<ProfileRegistry>,
        mut core: CoreSettings,
        work_dir: impl Into<PathBuf>,
        profiles: &[Profile],
    ) -> Self {
        core.crash_threshold = 1;
        Self {
            generator,
            registry,
            core,
            work_dir: work_dir.into(),
            profiles: profiles.to_vec(),
            batch: OnceCell::new(),
        }
    }

    async fn launch(&self) -> Result<BatchCore, ProbeError> {
        let batch = {
            let snapshot = self.registry.snapshot();
            let targets: Vec<&Profile> = self.profiles.iter().collect();
            let mut used = HashSet::new();
            let listen_ports = std::iter::from_fn(|| loop {
                match free_local_port() {
                    Ok(port) if used.insert(port) => return Some(port),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "no free port for batch probe inbound");
                        return None;
                    }
                }
            });
            self.generator
                .generate_test_batch(&*snapshot, &targets, listen_ports)
        };
        let skipped = batch
            .skipped
            .into_iter()
            .map(|(id, e)| (id, e.to_string()))
            .collect();
        let config_path = self
            .work_dir
            .join(format!("batch-{}.json", &batch.document.hash()[..12]));
        let core = DisposableCore {
            supervisor: CoreSupervisor::new(self.core.clone(), config_path),
        };
        if !batch.ports.is_empty() {
            core.supervisor
                .start(batch.document)
                .await
                .map_err(|e| ProbeError::new(TestErrorKind::Other, format!("batch core: {e}")))?;
            tracing::debug!(profiles = batch.ports.len(), "batch probe core running");
        }
        Ok(BatchCore {
            core,
            ports: batch.ports,
            skipped,
        })
    }
}

#[async_trait]
impl Prober for BatchCoreProber {
    async fn probe(
        &self,
        profile: &Profile,
        options: &ProbeOptions,
        abandon: &CancellationToken,
    ) -> Result<Duration, ProbeError> {
        let batch = tokio::select! {
            _ = abandon.cancelled() => {
                return Err(ProbeError::new(TestErrorKind::Cancelled, "abandoned"));
            }
            b = self.batch.get_or_init(|| self.launch()) => b,
        };
        let batch = batch.as_ref().map_err(|e| e.clone())?;
        if let Some(reason) = batch.skipped.get(&profile.id) {
            return Err(ProbeError::new(TestErrorKind::Config, reason.clone()));
        }
        let Some(port) = batch.ports.get(&profile.id) else {
            return Err(ProbeError::new(
                TestErrorKind::Config,
                format!("{} is not part of this batch", profile.label()),
            ));
        };
        let state = batch.core.supervisor.state();
        if state != CoreState::Running {
            return Err(ProbeError::new(
                TestErrorKind::Other,
                format!("batch core is {state}"),
            ));
        }
        url_test(&format!("socks5h://127.0.0.1:{port}"), options, abandon).await
    }

    fn deadline(&self, options: &ProbeOptions) -> Duration {
        // 第一个探测要等 core 就绪
        options.timeout + self.core.ready_timeout()
    }
}

/// 经运行中的 core 测试当前 profile
pub struct SharedCoreProber {
    supervisor: CoreSupervisor,
    proxy: String,
}

impl SharedCoreProber {
    /// `mixed_addr` 形如 `127.0.0.1:2080`
    pub fn new(supervisor: CoreSupervisor, mixed_addr: &str) -> Self {
        Self {
            supervisor,
            proxy: format!("socks5h://{mixed_addr}"),
        }
    }
}

#[async_trait]
impl Prober for SharedCoreProber {
    async fn probe(
        &self,
        profile: &Profile,
        options: &ProbeOptions,
        abandon: &CancellationToken,
    ) -> Result<Duration, ProbeError> {
        let instance = self.supervisor.snapshot();
        if instance.state != CoreState::Running {
            return Err(ProbeError::new(
                TestErrorKind::Other,
                format!("core is {}", instance.state),
            ));
        }
        if instance.profile_id != Some(profile.id) {
            return Err(ProbeError::new(
                TestErrorKind::Config,
                format!("{} is not the running profile", profile.label()),
            ));
        }
        url_test(&self.proxy, options, abandon).await
    }
}

/// 只测 TCP 握手时间，不经过 core
#[derive(Debug, Default)]
pub struct TcpPingProber;

#[async_trait]
impl Prober for TcpPingProber {
    async fn probe(
        &self,
        profile: &Profile,
        options: &ProbeOptions,
        abandon: &CancellationToken,
    ) -> Result<Duration, ProbeError> {
        let Some((host, port)) = profile.bean.protocol().server() else {
            return Err(ProbeError::new(
                TestErrorKind::Config,
                format!("{} has no server address", profile.label()),
            ));
        };
        let started = Instant::now();
        let connect = tokio::time::timeout(options.timeout, tokio::net::TcpStream::connect((host, port)));
        tokio::select! {
            _ = abandon.cancelled() => Err(ProbeError::new(TestErrorKind::Cancelled, "abandoned")),
            r = connect => match r {
                Ok(Ok(_)) => Ok(started.elapsed()),
                Ok(Err(e)) => Err(ProbeError::new(TestErrorKind::Connect, e.to_string())),
                Err(_) => Err(ProbeError::new(TestErrorKind::Timeout, "connect timed out")),
            },
        }
    }
}
