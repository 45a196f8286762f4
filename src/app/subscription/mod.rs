//! 订阅同步
//!
//! 每个组同一时间最多一个同步在进行，重复请求立即以 [`SyncError::InProgress`]
//! 拒绝。下载和解析在注册表之外完成；差异计算与写入放在同一次注册表更新里，
//! 取消或失败都不会留下改了一半的组。

pub mod diff;
pub mod fetch;
pub mod scheduler;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::subscription::{parse_subscription, ParseError};
use crate::config::types::SubscriptionSettings;
use crate::model::{unix_secs, GroupId, GroupKind, ProfileId, ProfileOrigin, SubscriptionInfo};
use crate::store::{ProfileData, ProfileRegistry, RegistryError, StoreError};

pub use fetch::{FetchError, FetchRequest, FetchedDocument, Fetcher, HttpFetcher};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("group #{group}: a sync is already in progress")]
    InProgress { group: GroupId },

    #[error("{group}: not a subscription group")]
    NotSubscription { group: String },

    #[error("{group}: fetch failed: {source}")]
    Fetch {
        group: String,
        #[source]
        source: FetchError,
    },

    #[error("{group}: {source}")]
    Parse {
        group: String,
        #[source]
        source: ParseError,
    },

    #[error("{group}: sync cancelled")]
    Cancelled { group: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Registry(RegistryError::Store(e))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileRef {
    pub id: ProfileId,
    pub name: String,
}

/// 一次同步的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub group: GroupId,
    pub added: Vec<ProfileRef>,
    pub updated: Vec<ProfileRef>,
    pub removed: Vec<ProfileRef>,
    /// 本次新标记为 stale 的成员
    pub stale: Vec<ProfileRef>,
    /// 无法解析而跳过的条目数
    pub skipped: usize,
    pub info: SubscriptionInfo,
}

impl SyncReport {
    /// 成员没有任何变化
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.stale.is_empty()
    }
}

/// 返回当前可用作下载代理的地址（core 运行时才有）
pub type ProxyResolver = Arc<dyn Fn() -> Option<String> + Send + Sync>;

pub struct SubscriptionSyncer {
    registry: Arc<ProfileRegistry>,
    fetcher: Arc<dyn Fetcher>,
    settings: SubscriptionSettings,
    proxy: Option<ProxyResolver>,
    in_flight: Mutex<HashSet<GroupId>>,
}

/// 离开作用域时释放组的同步占用
struct InFlight<'a> {
    set: &'a Mutex<HashSet<GroupId>>,
    group: GroupId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.group);
    }
}

impl SubscriptionSyncer {
    pub fn new(
        registry: Arc<ProfileRegistry>,
        fetcher: Arc<dyn Fetcher>,
        settings: SubscriptionSettings,
    ) -> Self {
        Self {
            registry,
            fetcher,
            settings,
            proxy: None,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_proxy_resolver(mut self, resolver: ProxyResolver) -> Self {
        self.proxy = Some(resolver);
        self
    }

    fn acquire(&self, group: GroupId) -> Result<InFlight<'_>, SyncError> {
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(group) {
            return Err(SyncError::InProgress { group });
        }
        Ok(InFlight {
            set: &self.in_flight,
            group,
        })
    }

    pub fn is_syncing(&self, group: GroupId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&group)
    }

    /// 同步一个订阅组
    pub async fn sync(
        &self,
        group: GroupId,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let _guard = self.acquire(group)?;

        let snapshot = self.registry.snapshot();
        let g = snapshot
            .group(group)
            .ok_or_else(|| RegistryError::not_found(format!("group #{group}")))?;
        let label = g.label();
        let source = match (&g.kind, &g.subscription) {
            (GroupKind::Subscription, Some(source)) => source.clone(),
            _ => return Err(SyncError::NotSubscription { group: label }),
        };
        drop(snapshot);

        let request = FetchRequest {
            url: source.url.clone(),
            user_agent: source
                .user_agent
                .clone()
                .unwrap_or_else(|| self.settings.user_agent.clone()),
            proxy: if source.use_proxy {
                self.proxy.as_ref().and_then(|resolve| resolve())
            } else {
                None
            },
            ignore_tls_errors: source.ignore_tls_errors,
            timeout: Duration::from_millis(self.settings.timeout_ms),
        };
        tracing::debug!(group = %label, url = %request.url, proxied = request.proxy.is_some(), "fetching subscription");

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled { group: label }),
            r = self.fetcher.fetch(&request) => r.map_err(|source| SyncError::Fetch {
                group: label.clone(),
                source,
            })?,
        };

        let parsed = parse_subscription(&fetched.body).map_err(|source| SyncError::Parse {
            group: label.clone(),
            source,
        })?;

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled { group: label });
        }

        let info = fetched.info;
        let skipped = parsed.skipped;
        let report = self.registry.update(|data| {
            // 以写锁下的最新状态计算差异
            let current = data
                .group(group)
                .ok_or_else(|| RegistryError::not_found(label.clone()))?;
            let source = current
                .subscription
                .clone()
                .ok_or_else(|| SyncError::NotSubscription {
                    group: label.clone(),
                })?;
            let plan = diff::plan(&data.members(group), &parsed.candidates, &source);
            apply_plan(data, group, plan, info, skipped)
        })?;

        tracing::info!(
            group = %label,
            added = report.added.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            stale = report.stale.len(),
            skipped = report.skipped,
            "subscription synced"
        );
        Ok(report)
    }

    /// 多个组并发同步，互不影响，每组一个结果
    pub async fn sync_all(
        &self,
        groups: &[GroupId],
        cancel: &CancellationToken,
    ) -> Vec<(GroupId, Result<SyncReport, SyncError>)> {
        let mut seen = HashSet::new();
        let unique: Vec<GroupId> = groups.iter().copied().filter(|g| seen.insert(*g)).collect();
        let results = join_all(unique.iter().map(|g| self.sync(*g, cancel))).await;
        for (group, result) in unique.iter().zip(&results) {
            if let Err(e) = result {
                tracing::warn!(group = *group, error = %e, "subscription sync failed");
            }
        }
        unique.into_iter().zip(results).collect()
    }

    /// 所有订阅组
    pub fn subscription_groups(&self) -> Vec<GroupId> {
        self.registry
            .snapshot()
            .groups()
            .filter(|g| g.kind == GroupKind::Subscription && g.subscription.is_some())
            .map(|g| g.id)
            .collect()
    }

    /// 自动更新已到期的组
    pub fn due_groups(&self, now_secs: u64) -> Vec<GroupId> {
        self.registry
            .snapshot()
            .groups()
            .filter(|g| g.update_due(now_secs))
            .map(|g| g.id)
            .collect()
    }
}

fn apply_plan(
    data: &mut ProfileData,
    group: GroupId,
    plan: diff::SyncPlan,
    info: SubscriptionInfo,
    skipped: usize,
) -> Result<SyncReport, SyncError> {
    let mut report = SyncReport {
        group,
        skipped,
        ..Default::default()
    };

    for (id, candidate) in plan.update {
        let profile = data.profile_mut(id)?;
        profile.name = candidate.name;
        profile.bean = candidate.bean;
        profile.stale = false;
        report.updated.push(ProfileRef {
            id,
            name: profile.display_name().to_string(),
        });
    }
    for id in plan.mark_stale {
        let profile = data.profile_mut(id)?;
        profile.stale = true;
        report.stale.push(ProfileRef {
            id,
            name: profile.display_name().to_string(),
        });
    }
    for id in plan.remove {
        let profile = data.remove_profile(id)?;
        report.removed.push(ProfileRef {
            id,
            name: profile.display_name().to_string(),
        });
    }
    for candidate in plan.add {
        let name = candidate.name.clone();
        let id = data.insert_profile(
            Some(group),
            candidate.name,
            candidate.bean,
            ProfileOrigin::Subscription,
        )?;
        report.added.push(ProfileRef { id, name });
    }

    let g = data.group_mut(group)?;
    g.last_update = Some(unix_secs());
    if !info.is_empty() {
        g.info = info.clone();
    }
    report.info = info;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SubscriptionSource;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowFetcher {
        body: String,
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl Fetcher for SlowFetcher {
        async fn fetch(&self, _request: &FetchRequest) -> Result<FetchedDocument, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(FetchedDocument {
                body: self.body.clone(),
                info: SubscriptionInfo::default(),
            })
        }
    }

    fn setup(delay: Duration) -> (Arc<ProfileRegistry>, Arc<SlowFetcher>, GroupId) {
        let registry = Arc::new(ProfileRegistry::in_memory());
        let group = registry
            .update(|d| {
                let id = d.insert_group("sub", GroupKind::Subscription);
                d.group_mut(id)?.subscription = Some(SubscriptionSource::new("https://sub.example"));
                Ok::<_, RegistryError>(id)
            })
            .unwrap();
        let fetcher = Arc::new(SlowFetcher {
            body: "trojan://pw@a.example:443#A\ntrojan://pw@b.example:443#B\n".into(),
            calls: AtomicUsize::new(0),
            delay,
        });
        (registry, fetcher, group)
    }

    #[tokio::test]
    async fn second_sync_for_same_group_rejected() {
        let (registry, fetcher, group) = setup(Duration::from_millis(100));
        let syncer = SubscriptionSyncer::new(registry, fetcher, SubscriptionSettings::default());
        let cancel = CancellationToken::new();
        let (a, b) = tokio::join!(syncer.sync(group, &cancel), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            syncer.sync(group, &cancel).await
        });
        assert_eq!(a.unwrap().added.len(), 2);
        assert!(matches!(b, Err(SyncError::InProgress { .. })));
        assert!(!syncer.is_syncing(group));
    }

    #[tokio::test]
    async fn cancelled_sync_changes_nothing() {
        let (registry, fetcher, group) = setup(Duration::from_secs(5));
        let syncer = SubscriptionSyncer::new(registry.clone(), fetcher, SubscriptionSettings::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let r = syncer.sync(group, &cancel).await;
        assert!(matches!(r, Err(SyncError::Cancelled { .. })));
        assert!(registry.snapshot().members(group).is_empty());
        assert!(registry.snapshot().group(group).unwrap().last_update.is_none());
    }

    #[tokio::test]
    async fn basic_group_is_not_synced() {
        let (registry, fetcher, _) = setup(Duration::ZERO);
        let basic = registry.add_group("mine", GroupKind::Basic).unwrap();
        let syncer = SubscriptionSyncer::new(registry, fetcher.clone(), SubscriptionSettings::default());
        let r = syncer.sync(basic, &CancellationToken::new()).await;
        assert!(matches!(r, Err(SyncError::NotSubscription { .. })));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }
}
