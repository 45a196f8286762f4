use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{SubscriptionSyncer, SyncReport};
use crate::model::{unix_secs, GroupId};

/// 启动自动更新任务
///
/// 每个周期找出到期的订阅组并发同步。失败的组不会写入 `last_update`，
/// 这里单独记下尝试时间，重试要等到下一个更新间隔。
pub fn spawn_auto_update(
    syncer: Arc<SubscriptionSyncer>,
    check_interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut attempts: HashMap<GroupId, u64> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let now = unix_secs();
                    let due = due_after_attempts(&syncer, &attempts, now);
                    if due.is_empty() {
                        continue;
                    }
                    tracing::debug!(groups = ?due, "auto-updating subscriptions");
                    for group in &due {
                        attempts.insert(*group, now);
                    }
                    for (group, result) in syncer.sync_all(&due, &cancel).await {
                        if let Ok(report) = result {
                            log_report(&report);
                        } else {
                            tracing::debug!(group, "auto-update will retry next interval");
                        }
                    }
                }
            }
        }
        tracing::debug!("subscription auto-update stopped");
    })
}

fn due_after_attempts(
    syncer: &SubscriptionSyncer,
    attempts: &HashMap<GroupId, u64>,
    now: u64,
) -> Vec<GroupId> {
    let snapshot = syncer.registry.snapshot();
    syncer
        .due_groups(now)
        .into_iter()
        .filter(|id| {
            let Some(last) = attempts.get(id) else {
                return true;
            };
            let interval = snapshot
                .group(*id)
                .map_or(0, |g| u64::from(g.auto_update_mins) * 60);
            now.saturating_sub(*last) >= interval
        })
        .collect()
}

fn log_report(report: &SyncReport) {
    if report.is_empty() {
        tracing::debug!(group = report.group, "subscription unchanged");
    } else {
        tracing::info!(
            group = report.group,
            added = report.added.len(),
            removed = report.removed.len(),
            "subscription auto-updated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::subscription::{FetchError, FetchRequest, FetchedDocument, Fetcher};
    use crate::config::types::SubscriptionSettings;
    use crate::model::{GroupKind, SubscriptionInfo, SubscriptionSource};
    use crate::store::{ProfileRegistry, RegistryError};
    use async_trait::async_trait;

    struct Failing;

    #[async_trait]
    impl Fetcher for Failing {
        async fn fetch(&self, _request: &FetchRequest) -> Result<FetchedDocument, FetchError> {
            Err(FetchError::Status(503))
        }
    }

    struct Fixed;

    #[async_trait]
    impl Fetcher for Fixed {
        async fn fetch(&self, _request: &FetchRequest) -> Result<FetchedDocument, FetchError> {
            Ok(FetchedDocument {
                body: "trojan://pw@a.example:443#A\n".into(),
                info: SubscriptionInfo::default(),
            })
        }
    }

    fn registry_with_due_group() -> (Arc<ProfileRegistry>, GroupId) {
        let registry = Arc::new(ProfileRegistry::in_memory());
        let id = registry
            .update(|d| {
                let id = d.insert_group("sub", GroupKind::Subscription);
                let g = d.group_mut(id)?;
                g.subscription = Some(SubscriptionSource::new("https://sub.example"));
                g.auto_update_mins = 30;
                Ok::<_, RegistryError>(id)
            })
            .unwrap();
        (registry, id)
    }

    #[test]
    fn failed_group_waits_for_next_interval() {
        let (registry, id) = registry_with_due_group();
        let syncer = SubscriptionSyncer::new(registry, Arc::new(Failing), SubscriptionSettings::default());
        let mut attempts = HashMap::new();
        assert_eq!(due_after_attempts(&syncer, &attempts, 10_000), vec![id]);
        attempts.insert(id, 10_000);
        assert!(due_after_attempts(&syncer, &attempts, 10_060).is_empty());
        assert_eq!(due_after_attempts(&syncer, &attempts, 10_000 + 1800), vec![id]);
    }

    #[tokio::test]
    async fn auto_update_syncs_due_group() {
        let (registry, id) = registry_with_due_group();
        let syncer = Arc::new(SubscriptionSyncer::new(
            registry.clone(),
            Arc::new(Fixed),
            SubscriptionSettings::default(),
        ));
        let cancel = CancellationToken::new();
        let handle = spawn_auto_update(syncer, Duration::from_millis(10), cancel.clone());
        for _ in 0..100 {
            if !registry.snapshot().members(id).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(registry.snapshot().members(id).len(), 1);
        assert!(registry.snapshot().group(id).unwrap().last_update.is_some());
    }
}
