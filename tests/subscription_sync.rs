//! 订阅同步：差异合并、幂等、批量更新

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use corewarden::app::subscription::{
    FetchError, FetchRequest, FetchedDocument, Fetcher, SubscriptionSyncer, SyncError,
};
use corewarden::config::types::SubscriptionSettings;
use corewarden::model::bean::TrojanBean;
use corewarden::model::{
    GroupId, GroupKind, ProfileOrigin, ProxyBean, SubscriptionInfo, SubscriptionSource,
};
use corewarden::store::{ProfileRegistry, RegistryError};
use tokio_util::sync::CancellationToken;

/// 按 URL 返回内存中的订阅内容
#[derive(Default)]
struct MemoryFetcher {
    bodies: Mutex<HashMap<String, Result<String, u16>>>,
}

impl MemoryFetcher {
    fn serve(&self, url: &str, body: &str) {
        self.bodies
            .lock()
            .unwrap()
            .insert(url.to_string(), Ok(body.to_string()));
    }

    fn fail(&self, url: &str, status: u16) {
        self.bodies
            .lock()
            .unwrap()
            .insert(url.to_string(), Err(status));
    }
}

#[async_trait::async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedDocument, FetchError> {
        match self.bodies.lock().unwrap().get(&request.url) {
            Some(Ok(body)) => Ok(FetchedDocument {
                body: body.clone(),
                info: SubscriptionInfo {
                    total: Some(1024),
                    ..Default::default()
                },
            }),
            Some(Err(status)) => Err(FetchError::Status(*status)),
            None => Err(FetchError::Status(404)),
        }
    }
}

const A: &str = "trojan://pw@a.example.com:443";
const B: &str = "trojan://pw@b.example.com:443";
const C: &str = "trojan://pw@c.example.com:443";

fn setup() -> (Arc<ProfileRegistry>, Arc<MemoryFetcher>, SubscriptionSyncer) {
    let registry = Arc::new(ProfileRegistry::in_memory());
    let fetcher = Arc::new(MemoryFetcher::default());
    let syncer = SubscriptionSyncer::new(
        Arc::clone(&registry),
        Arc::clone(&fetcher) as Arc<dyn Fetcher>,
        SubscriptionSettings::default(),
    );
    (registry, fetcher, syncer)
}

fn subscription_group(registry: &ProfileRegistry, url: &str, source: impl FnOnce(&mut SubscriptionSource)) -> GroupId {
    let id = registry.add_group("airport", GroupKind::Subscription).unwrap();
    let mut src = SubscriptionSource::new(url);
    source(&mut src);
    registry
        .edit_group(id, |g| g.subscription = Some(src))
        .unwrap();
    id
}

fn member_names(registry: &ProfileRegistry, group: GroupId) -> Vec<(String, bool)> {
    registry
        .snapshot()
        .members(group)
        .into_iter()
        .map(|p| (p.name.clone(), p.stale))
        .collect()
}

/// {A, B} → {A 改名, C}：A 原地更新且 id 不变，B 标记 stale，C 新增
#[tokio::test]
async fn rename_add_and_stale() {
    let (registry, fetcher, syncer) = setup();
    let group = subscription_group(&registry, "mem://sub", |_| {});
    let cancel = CancellationToken::new();

    fetcher.serve("mem://sub", &format!("{A}#a\n{B}#b\n"));
    let first = syncer.sync(group, &cancel).await.unwrap();
    assert_eq!(first.added.len(), 2);
    let a_id = first.added[0].id;

    fetcher.serve("mem://sub", &format!("{A}#a-renamed\n{C}#c\n"));
    let report = syncer.sync(group, &cancel).await.unwrap();
    assert_eq!(report.updated.len(), 1);
    assert_eq!(report.updated[0].id, a_id);
    assert_eq!(report.added.len(), 1);
    assert_eq!(report.stale.len(), 1);
    assert!(report.removed.is_empty());

    let snapshot = registry.snapshot();
    let a = snapshot.profile(a_id).unwrap();
    assert_eq!(a.name, "a-renamed");
    assert_eq!(a.origin, ProfileOrigin::Subscription);
    assert_eq!(
        member_names(&registry, group),
        vec![
            ("a-renamed".to_string(), false),
            ("b".to_string(), true),
            ("c".to_string(), false),
        ]
    );
    let g = snapshot.group(group).unwrap();
    assert!(g.last_update.is_some());
    assert_eq!(g.info.total, Some(1024));
}

#[tokio::test]
async fn unchanged_subscription_is_idempotent() {
    let (registry, fetcher, syncer) = setup();
    let group = subscription_group(&registry, "mem://sub", |_| {});
    let cancel = CancellationToken::new();
    fetcher.serve("mem://sub", &format!("{A}#a\n{B}#b\n"));

    syncer.sync(group, &cancel).await.unwrap();
    let before = member_names(&registry, group);
    let again = syncer.sync(group, &cancel).await.unwrap();
    assert!(again.is_empty(), "{again:?}");
    assert_eq!(member_names(&registry, group), before);
}

#[tokio::test]
async fn clear_before_update_removes_missing() {
    let (registry, fetcher, syncer) = setup();
    let group = subscription_group(&registry, "mem://sub", |s| s.clear_before_update = true);
    let cancel = CancellationToken::new();

    fetcher.serve("mem://sub", &format!("{A}#a\n{B}#b\n"));
    syncer.sync(group, &cancel).await.unwrap();
    fetcher.serve("mem://sub", &format!("{A}#a\n"));
    let report = syncer.sync(group, &cancel).await.unwrap();

    assert_eq!(report.removed.len(), 1);
    assert_eq!(report.removed[0].name, "b");
    assert_eq!(member_names(&registry, group), vec![("a".to_string(), false)]);
}

#[tokio::test]
async fn stale_member_revives_when_it_returns() {
    let (registry, fetcher, syncer) = setup();
    let group = subscription_group(&registry, "mem://sub", |_| {});
    let cancel = CancellationToken::new();

    fetcher.serve("mem://sub", &format!("{A}#a\n{B}#b\n"));
    syncer.sync(group, &cancel).await.unwrap();
    fetcher.serve("mem://sub", &format!("{A}#a\n"));
    syncer.sync(group, &cancel).await.unwrap();
    fetcher.serve("mem://sub", &format!("{A}#a\n{B}#b\n"));
    let report = syncer.sync(group, &cancel).await.unwrap();

    assert_eq!(report.updated.len(), 1);
    assert!(member_names(&registry, group).iter().all(|(_, stale)| !stale));
}

#[tokio::test]
async fn subscription_group_rejects_manual_profiles() {
    let (registry, fetcher, syncer) = setup();
    let group = subscription_group(&registry, "mem://sub", |_| {});
    fetcher.serve("mem://sub", &format!("{A}#a\n"));
    syncer.sync(group, &CancellationToken::new()).await.unwrap();

    let err = registry
        .add_profile(
            Some(group),
            "mine",
            ProxyBean::Trojan(TrojanBean {
                server: "m.example.com".into(),
                port: 443,
                password: "pw".into(),
                ..Default::default()
            }),
        )
        .unwrap_err();
    assert!(matches!(err, RegistryError::Rejected { .. }));
    assert_eq!(member_names(&registry, group), vec![("a".to_string(), false)]);
}

#[tokio::test]
async fn fetch_failure_leaves_group_untouched() {
    let (registry, fetcher, syncer) = setup();
    let group = subscription_group(&registry, "mem://sub", |_| {});
    let cancel = CancellationToken::new();
    fetcher.serve("mem://sub", &format!("{A}#a\n"));
    syncer.sync(group, &cancel).await.unwrap();
    let before = registry.snapshot();

    fetcher.fail("mem://sub", 503);
    let err = syncer.sync(group, &cancel).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Fetch {
            source: FetchError::Status(503),
            ..
        }
    ));
    let after = registry.snapshot();
    assert_eq!(
        after.group(group).unwrap().last_update,
        before.group(group).unwrap().last_update
    );
    assert_eq!(member_names(&registry, group), vec![("a".to_string(), false)]);
}

#[tokio::test]
async fn batch_continues_past_failed_group() {
    let (registry, fetcher, syncer) = setup();
    let broken = subscription_group(&registry, "mem://broken", |_| {});
    let good = subscription_group(&registry, "mem://good", |_| {});
    fetcher.fail("mem://broken", 500);
    fetcher.serve("mem://good", &format!("{A}#a\n{C}#c\n"));

    let results = syncer
        .sync_all(&syncer.subscription_groups(), &CancellationToken::new())
        .await;
    assert_eq!(results.len(), 2);
    for (group, result) in results {
        if group == broken {
            assert!(result.is_err());
        } else {
            assert_eq!(group, good);
            assert_eq!(result.unwrap().added.len(), 2);
        }
    }
    assert_eq!(member_names(&registry, good).len(), 2);
    assert!(member_names(&registry, broken).is_empty());
}

#[tokio::test]
async fn registry_file_reflects_sync() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("profiles.json");
    let registry = Arc::new(ProfileRegistry::open(&path).unwrap());
    let fetcher = Arc::new(MemoryFetcher::default());
    let syncer = SubscriptionSyncer::new(
        Arc::clone(&registry),
        Arc::clone(&fetcher) as Arc<dyn Fetcher>,
        SubscriptionSettings::default(),
    );
    let group = subscription_group(&registry, "mem://sub", |_| {});
    fetcher.serve("mem://sub", &format!("{A}#a\n{B}#b\n"));
    syncer.sync(group, &CancellationToken::new()).await.unwrap();
    drop(syncer);
    drop(registry);

    let reopened = ProfileRegistry::open(&path).unwrap();
    assert_eq!(member_names(&reopened, group).len(), 2);
}

#[tokio::test]
async fn user_display_name_survives_update() {
    let (registry, fetcher, syncer) = setup();
    let group = subscription_group(&registry, "mem://sub", |_| {});
    let cancel = CancellationToken::new();
    fetcher.serve("mem://sub", &format!("{A}#a\n"));
    let id = syncer.sync(group, &cancel).await.unwrap().added[0].id;
    registry
        .edit_profile(id, |p| p.name_override = Some("my favourite".into()))
        .unwrap();

    fetcher.serve("mem://sub", &format!("{A}#a-v2\n"));
    let report = syncer.sync(group, &cancel).await.unwrap();
    assert_eq!(report.updated[0].name, "my favourite");
    let snapshot = registry.snapshot();
    let profile = snapshot.profile(id).unwrap();
    assert_eq!(profile.name, "a-v2");
    assert_eq!(profile.display_name(), "my favourite");
}
