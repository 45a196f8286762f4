pub mod probe;
pub mod subscription;
pub mod supervisor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::builder::{BuildMode, ConfigGenerator, CoreConfigDocument};
use crate::common::ControlError;
use crate::config::Settings;
use crate::model::{GroupId, Profile, ProfileId, RouteId};
use crate::store::{ProfileRegistry, RegistryError, RouteRegistry};

use latency_test::{LatencyTester, TestOptions, TestSession};
use probe::{
    BatchCoreProber, DisposableCoreProber, ProbeMode, Prober, SharedCoreProber, TcpPingProber,
};
use subscription::{Fetcher, HttpFetcher, SubscriptionSyncer, SyncError, SyncReport};
use supervisor::{CoreInstance, CoreState, CoreSupervisor};

/// 控制面上下文，持有各组件的唯一实例，显式传递
pub struct App {
    settings: Settings,
    profiles: Arc<ProfileRegistry>,
    routes: Arc<RouteRegistry>,
    generator: Arc<ConfigGenerator>,
    supervisor: CoreSupervisor,
    syncer: Arc<SubscriptionSyncer>,
    tun_enabled: AtomicBool,
    tun_switching: AtomicBool,
}

/// 切换结束时清除占用标记
struct TunSwitch<'a>(&'a AtomicBool);

impl Drop for TunSwitch<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl App {
    /// 从数据目录加载注册表
    pub fn open(settings: Settings) -> Result<Self, ControlError> {
        let profiles = Arc::new(ProfileRegistry::open(settings.profiles_path())?);
        let routes = Arc::new(RouteRegistry::open(settings.routes_path())?);
        Ok(Self::with_parts(settings, profiles, routes, Arc::new(HttpFetcher::new())))
    }

    pub fn with_parts(
        settings: Settings,
        profiles: Arc<ProfileRegistry>,
        routes: Arc<RouteRegistry>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let generator = Arc::new(ConfigGenerator::from_settings(&settings));
        let supervisor = CoreSupervisor::new(settings.core.clone(), settings.core_config_path());

        let running = supervisor.clone();
        let mixed = mixed_addr(&settings);
        let syncer = SubscriptionSyncer::new(
            Arc::clone(&profiles),
            fetcher,
            settings.subscription.clone(),
        )
        .with_proxy_resolver(Arc::new(move || {
            (running.state() == CoreState::Running).then(|| format!("socks5h://{mixed}"))
        }));

        Self {
            tun_enabled: AtomicBool::new(settings.inbound.tun.enabled),
            tun_switching: AtomicBool::new(false),
            settings,
            profiles,
            routes,
            generator,
            supervisor,
            syncer: Arc::new(syncer),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn profiles(&self) -> &Arc<ProfileRegistry> {
        &self.profiles
    }

    pub fn routes(&self) -> &Arc<RouteRegistry> {
        &self.routes
    }

    pub fn supervisor(&self) -> &CoreSupervisor {
        &self.supervisor
    }

    pub fn syncer(&self) -> &Arc<SubscriptionSyncer> {
        &self.syncer
    }

    pub fn tun_enabled(&self) -> bool {
        self.tun_enabled.load(Ordering::Acquire)
    }

    /// 以当前快照生成运行配置；`route` 为空时用生效中的路由
    pub fn generate(
        &self,
        profile: ProfileId,
        route: Option<RouteId>,
    ) -> Result<CoreConfigDocument, ControlError> {
        let snapshot = self.profiles.snapshot();
        let target = snapshot
            .profile(profile)
            .ok_or_else(|| RegistryError::not_found(format!("profile #{profile}")))?;
        let routing = match route {
            Some(id) => self
                .routes
                .get(id)
                .ok_or_else(|| RegistryError::not_found(format!("route #{id}")))?,
            None => self.routes.active(),
        };
        let overrides = snapshot.group_of(target).and_then(|g| g.active_overrides());
        let doc = self.generator.generate(
            &*snapshot,
            target,
            &routing,
            overrides,
            BuildMode::Run {
                tun: self.tun_enabled(),
            },
        )?;
        Ok(doc)
    }

    /// 校验失败时不触碰正在运行的 core
    pub async fn start_profile(&self, profile: ProfileId) -> Result<CoreInstance, ControlError> {
        let doc = self.generate(profile, None)?;
        info!(profile, hash = doc.hash(), "starting profile");
        match self.supervisor.state() {
            CoreState::Stopped | CoreState::CrashLoop => Ok(self.supervisor.start(doc).await?),
            _ => {
                self.supervisor.apply(doc).await?;
                Ok(self.supervisor.snapshot())
            }
        }
    }

    pub async fn stop(&self) -> Result<(), ControlError> {
        Ok(self.supervisor.stop().await?)
    }

    /// 切换 TUN；已有切换在进行时立即拒绝
    pub async fn set_tun(&self, enabled: bool) -> Result<(), ControlError> {
        if self
            .tun_switching
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ControlError::TunBusy);
        }
        let _switch = TunSwitch(&self.tun_switching);
        let previous = self.tun_enabled.swap(enabled, Ordering::AcqRel);
        if previous == enabled {
            return Ok(());
        }
        info!(enabled, "TUN mode switched");

        let running = self.supervisor.snapshot();
        if let (CoreState::Running, Some(profile)) = (running.state, running.profile_id) {
            if let Err(e) = self.start_profile(profile).await {
                self.tun_enabled.store(previous, Ordering::Release);
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn sync(
        &self,
        group: GroupId,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, ControlError> {
        Ok(self.syncer.sync(group, cancel).await?)
    }

    /// 同步全部订阅组，单组失败不影响其他组
    pub async fn update_all(
        &self,
        cancel: &CancellationToken,
    ) -> Vec<(GroupId, Result<SyncReport, SyncError>)> {
        let groups = self.syncer.subscription_groups();
        self.syncer.sync_all(&groups, cancel).await
    }

    pub fn spawn_auto_update(&self, cancel: CancellationToken) -> JoinHandle<()> {
        subscription::scheduler::spawn_auto_update(
            Arc::clone(&self.syncer),
            Duration::from_secs(self.settings.subscription.check_interval_secs.max(1)),
            cancel,
        )
    }

    /// 测试给定 profile；结果到达即写回注册表
    pub fn test(
        &self,
        ids: &[ProfileId],
        options: TestOptions,
        mode: ProbeMode,
    ) -> Result<TestSession, ControlError> {
        let profiles = self.collect(ids)?;
        let prober: Arc<dyn Prober> = match mode {
            ProbeMode::TcpPing => Arc::new(TcpPingProber),
            ProbeMode::UrlTest => Arc::new(DisposableCoreProber::new(
                Arc::clone(&self.generator),
                Arc::clone(&self.profiles),
                self.settings.core.clone(),
                self.settings.probe_dir(),
            )),
            ProbeMode::BatchUrlTest => Arc::new(BatchCoreProber::new(
                Arc::clone(&self.generator),
                Arc::clone(&self.profiles),
                self.settings.core.clone(),
                self.settings.probe_dir(),
                &profiles,
            )),
        };
        Ok(self.run_tester(prober, profiles, options))
    }

    /// 经运行中的 core 测试当前 profile
    pub fn test_running(&self, options: TestOptions) -> Result<TestSession, ControlError> {
        let instance = self.supervisor.snapshot();
        let profile = match (instance.state, instance.profile_id) {
            (CoreState::Running, Some(id)) => id,
            (state, _) => {
                return Err(supervisor::SupervisorError::InvalidState {
                    op: "test running profile",
                    state,
                }
                .into())
            }
        };
        let profiles = self.collect(&[profile])?;
        let prober = Arc::new(SharedCoreProber::new(
            self.supervisor.clone(),
            &mixed_addr(&self.settings),
        ));
        Ok(self.run_tester(prober, profiles, options))
    }

    pub fn test_options(&self) -> TestOptions {
        TestOptions::from_settings(&self.settings.test)
    }

    /// 组成员的分享链接，无法导出的跳过
    pub fn share_links(&self, group: GroupId) -> Result<Vec<String>, ControlError> {
        let snapshot = self.profiles.snapshot();
        if snapshot.group(group).is_none() {
            return Err(RegistryError::not_found(format!("group #{group}")).into());
        }
        Ok(snapshot
            .members(group)
            .into_iter()
            .filter_map(|p| p.bean.protocol().to_share_link(p.display_name()))
            .collect())
    }

    fn collect(&self, ids: &[ProfileId]) -> Result<Vec<Profile>, ControlError> {
        let snapshot = self.profiles.snapshot();
        if ids.is_empty() {
            return Ok(snapshot.profiles().cloned().collect());
        }
        ids.iter()
            .map(|id| {
                snapshot
                    .profile(*id)
                    .cloned()
                    .ok_or_else(|| ControlError::from(RegistryError::not_found(format!("profile #{id}"))))
            })
            .collect()
    }

    fn run_tester(
        &self,
        prober: Arc<dyn Prober>,
        profiles: Vec<Profile>,
        options: TestOptions,
    ) -> TestSession {
        LatencyTester::new(prober)
            .with_sink(Arc::clone(&self.profiles) as Arc<dyn latency_test::ResultSink>)
            .run(profiles, options)
    }
}

fn mixed_addr(settings: &Settings) -> String {
    let host = match settings.inbound.address.as_str() {
        "0.0.0.0" | "::" => "127.0.0.1",
        other => other,
    };
    if host.contains(':') {
        format!("[{host}]:{}", settings.inbound.mixed_port)
    } else {
        format!("{host}:{}", settings.inbound.mixed_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::bean::{SocksBean, VmessBean};
    use crate::model::ProxyBean;

    fn app() -> App {
        App::with_parts(
            Settings::default(),
            Arc::new(ProfileRegistry::in_memory()),
            Arc::new(RouteRegistry::in_memory()),
            Arc::new(HttpFetcher::new()),
        )
    }

    #[tokio::test]
    async fn invalid_profile_never_reaches_supervisor() {
        let app = app();
        let id = app
            .profiles()
            .add_profile(None, "broken", ProxyBean::Vmess(VmessBean::default()))
            .unwrap();
        let err = app.start_profile(id).await.unwrap_err();
        assert_eq!(err.kind(), crate::common::ErrorKind::ConfigValidation);
        assert_eq!(app.supervisor().state(), CoreState::Stopped);
        assert_eq!(app.supervisor().snapshot().generation, 0);
    }

    #[tokio::test]
    async fn concurrent_tun_switch_rejected() {
        let app = app();
        app.tun_switching.store(true, Ordering::Release);
        let err = app.set_tun(true).await.unwrap_err();
        assert!(matches!(err, ControlError::TunBusy));
        app.tun_switching.store(false, Ordering::Release);
        app.set_tun(true).await.unwrap();
        assert!(app.tun_enabled());
    }

    #[test]
    fn links_for_group_members() {
        let app = app();
        let g = app
            .profiles()
            .add_group("mine", crate::model::GroupKind::Basic)
            .unwrap();
        app.profiles()
            .add_profile(
                Some(g),
                "s",
                ProxyBean::Socks(SocksBean {
                    server: "1.2.3.4".into(),
                    port: 1080,
                    ..Default::default()
                }),
            )
            .unwrap();
        let links = app.share_links(g).unwrap();
        assert_eq!(links.len(), 1);
        assert!(links[0].starts_with("socks"));
    }

    #[test]
    fn mixed_addr_uses_loopback_for_wildcard() {
        let mut settings = Settings::default();
        settings.inbound.address = "0.0.0.0".into();
        settings.inbound.mixed_port = 7890;
        assert_eq!(mixed_addr(&settings), "127.0.0.1:7890");
    }
}
