//! 延迟测试会话：并发上限、取消、重测

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use corewarden::app::latency_test::{LatencyTester, ResultSink, TestOptions};
use corewarden::app::probe::{ProbeError, ProbeOptions, Prober};
use corewarden::model::bean::SocksBean;
use corewarden::model::{Profile, ProfileId, ProxyBean, TestErrorKind};
use corewarden::store::ProfileRegistry;
use tokio_util::sync::CancellationToken;

/// 记录同时在途的探测数
#[derive(Default)]
struct CountingProber {
    delay: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
    started: AtomicUsize,
    calls: Mutex<HashMap<ProfileId, u64>>,
}

impl CountingProber {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Prober for CountingProber {
    async fn probe(
        &self,
        profile: &Profile,
        _options: &ProbeOptions,
        abandon: &CancellationToken,
    ) -> Result<Duration, ProbeError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(profile.id).or_default();
            *n += 1;
            *n
        };
        let result = tokio::select! {
            _ = abandon.cancelled() => Err(ProbeError::new(TestErrorKind::Cancelled, "abandoned")),
            _ = tokio::time::sleep(self.delay) => Ok(Duration::from_millis(10 * call)),
        };
        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn profiles(n: u64) -> Vec<Profile> {
    (1..=n)
        .map(|id| {
            Profile::new(
                id,
                format!("node-{id}"),
                ProxyBean::Socks(SocksBean {
                    server: format!("10.0.0.{id}"),
                    port: 1080,
                    ..Default::default()
                }),
            )
        })
        .collect()
}

fn options(concurrency: usize) -> TestOptions {
    TestOptions {
        concurrency,
        timeout: Duration::from_secs(10),
        url: "http://cp.cloudflare.com/".into(),
        grace: Duration::from_millis(50),
    }
}

#[tokio::test]
async fn concurrency_never_exceeds_limit() {
    let prober = Arc::new(CountingProber::new(Duration::from_millis(30)));
    let tester = LatencyTester::new(Arc::clone(&prober) as Arc<dyn Prober>);
    let mut session = tester.run(profiles(20), options(5));

    let mut count = 0;
    while session.next().await.is_some() {
        count += 1;
    }
    assert_eq!(count, 20);
    let peak = prober.peak.load(Ordering::SeqCst);
    assert!(peak <= 5, "peak {peak}");
    assert!(peak >= 2, "probes never overlapped");

    let summary = session.finish().await;
    assert_eq!(summary.completed, 20);
    assert_eq!(summary.cancelled, 0);
}

#[tokio::test]
async fn cancel_stops_dispatch_and_abandons_in_flight() {
    let prober = Arc::new(CountingProber::new(Duration::from_secs(30)));
    let tester = LatencyTester::new(Arc::clone(&prober) as Arc<dyn Prober>);
    let mut session = tester.run(profiles(20), options(2));

    tokio::time::sleep(Duration::from_millis(50)).await;
    session.cancel();

    let mut emitted = Vec::new();
    let collect = async {
        while let Some(result) = session.next().await {
            emitted.push(result);
        }
    };
    tokio::time::timeout(Duration::from_secs(2), collect)
        .await
        .expect("session did not stop after cancel");

    assert_eq!(prober.started.load(Ordering::SeqCst), 2);
    assert_eq!(emitted.len(), 2);
    assert!(emitted
        .iter()
        .all(|r| r.error_kind() == Some(TestErrorKind::Cancelled)));

    let summary = session.finish().await;
    assert_eq!(summary.completed, 0);
    assert_eq!(summary.cancelled, 20);
}

#[tokio::test]
async fn cancel_within_grace_keeps_results() {
    let prober = Arc::new(CountingProber::new(Duration::from_millis(40)));
    let tester = LatencyTester::new(Arc::clone(&prober) as Arc<dyn Prober>);
    let mut opts = options(2);
    opts.grace = Duration::from_secs(1);
    let session = tester.run(profiles(10), opts);

    tokio::time::sleep(Duration::from_millis(10)).await;
    session.cancel();
    let summary = session.finish().await;

    assert_eq!(summary.completed, 2);
    assert_eq!(summary.cancelled, 8);
    assert_eq!(prober.started.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn retest_overwrites_session_result() {
    let prober = Arc::new(CountingProber::new(Duration::from_millis(100)));
    let tester = LatencyTester::new(Arc::clone(&prober) as Arc<dyn Prober>);
    let all = profiles(3);
    let first = all[0].clone();
    let mut session = tester.run(all, options(1));

    // 并发为 1，第一个结果到达时后面还有两个在排队
    let result = session.next().await.unwrap();
    assert_eq!(result.profile_id, first.id);
    assert_eq!(result.latency(), Some(Duration::from_millis(10)));
    assert!(session.retest(first.clone()));

    let mut for_first = 0;
    while let Some(r) = session.next().await {
        if r.profile_id == first.id {
            for_first += 1;
        }
    }
    assert_eq!(for_first, 1);
    assert_eq!(
        session.results()[&first.id].latency(),
        Some(Duration::from_millis(20))
    );
    // 会话结束后不再接受重测
    assert!(!session.retest(first));
}

#[tokio::test]
async fn slow_probe_times_out() {
    let prober = Arc::new(CountingProber::new(Duration::from_secs(30)));
    let tester = LatencyTester::new(Arc::clone(&prober) as Arc<dyn Prober>);
    let mut opts = options(1);
    opts.timeout = Duration::from_millis(100);
    let mut session = tester.run(profiles(1), opts);

    let result = session.next().await.unwrap();
    assert_eq!(result.error_kind(), Some(TestErrorKind::Timeout));
    let summary = session.finish().await;
    assert_eq!(summary.failed, 1);
}

#[tokio::test]
async fn results_written_back_to_registry() {
    let registry = Arc::new(ProfileRegistry::in_memory());
    for p in profiles(3) {
        registry
            .add_profile(None, &p.name, p.bean.clone())
            .unwrap();
    }
    let targets: Vec<Profile> = registry.snapshot().profiles().cloned().collect();

    let prober = Arc::new(CountingProber::new(Duration::from_millis(5)));
    let session = LatencyTester::new(prober as Arc<dyn Prober>)
        .with_sink(Arc::clone(&registry) as Arc<dyn ResultSink>)
        .run(targets, options(3));
    let session_id = session.id();
    session.finish().await;

    let snapshot = registry.snapshot();
    for profile in snapshot.profiles() {
        let last = profile.last_test.as_ref().expect("result stored");
        assert_eq!(last.session, session_id);
        assert_eq!(last.latency(), Some(Duration::from_millis(10)));
    }
}
