//! core 进程监控
//!
//! 状态机：`Stopped → Starting → Running → Stopping → Stopped`，
//! 崩溃过多进入 `CrashLoop`，直到手动 `reset()`。
//!
//! 每次启动、停止、自动重启都会递增代次（generation）。延迟执行的重启
//! 和已退出进程的回调都带着自己的代次，与当前代次不符时直接丢弃，
//! 因此手动 stop/start 之后不会被过期的回调改写状态。

pub mod crash;
pub mod log_ring;
pub mod process;

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::Child;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::builder::CoreConfigDocument;
use crate::config::types::CoreSettings;
use crate::model::{unix_millis, ProfileId};

pub use crash::{backoff_delay, CrashWindow};
pub use log_ring::{LogLine, LogRing, LogStream};
pub use process::ExitInfo;

const EVENT_CAPACITY: usize = 256;
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreState {
    Stopped,
    Starting,
    Running,
    Stopping,
    CrashLoop,
}

impl CoreState {
    pub fn as_str(self) -> &'static str {
        match self {
            CoreState::Stopped => "stopped",
            CoreState::Starting => "starting",
            CoreState::Running => "running",
            CoreState::Stopping => "stopping",
            CoreState::CrashLoop => "crash_loop",
        }
    }

    /// 有（或即将有）core 进程
    pub fn is_active(self) -> bool {
        matches!(self, CoreState::Starting | CoreState::Running)
    }
}

impl fmt::Display for CoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("core launch failed: {0}")]
    Launch(String),

    #[error("core is in a crash loop; reset required")]
    CrashLoop,

    #[error("cannot {op} while core is {state}")]
    InvalidState { op: &'static str, state: CoreState },

    #[error("failed to stage core config: {0}")]
    Stage(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub enum CoreEvent {
    StateChanged { state: CoreState, generation: u64 },
    Log(LogLine),
    Crashed {
        generation: u64,
        reason: String,
        crashes: usize,
    },
    RestartScheduled { generation: u64, delay: Duration },
    CrashLoop { crashes: usize },
    LaunchFailed { reason: String },
}

/// 状态变化通知（TUN、系统代理等）
pub trait StateHook: Send + Sync {
    fn on_state_change(&self, state: CoreState);
}

/// 运行时视图
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoreInstance {
    pub state: CoreState,
    pub pid: Option<u32>,
    /// 进入 Running 的 Unix 毫秒
    pub started_at: Option<u64>,
    pub restarts: u32,
    pub generation: u64,
    pub config_hash: Option<String>,
    pub profile_id: Option<ProfileId>,
}

struct Active {
    generation: u64,
    pid: Option<u32>,
    stop: CancellationToken,
    done: Option<JoinHandle<()>>,
    helpers: Vec<Child>,
}

struct Runtime {
    state: CoreState,
    generation: u64,
    document: Option<Arc<CoreConfigDocument>>,
    active: Option<Active>,
    crashes: CrashWindow,
    restarts: u32,
    started_at: Option<u64>,
}

/// 运行时锁。字段按声明顺序析构：先放锁，再把积攒的状态变化交给钩子，
/// 钩子里可以再读监控器
struct RuntimeGuard<'a> {
    rt: MutexGuard<'a, Runtime>,
    _hooks: HookFlush<'a>,
}

impl Deref for RuntimeGuard<'_> {
    type Target = Runtime;

    fn deref(&self) -> &Runtime {
        &self.rt
    }
}

impl DerefMut for RuntimeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Runtime {
        &mut self.rt
    }
}

struct HookFlush<'a>(&'a Inner);

impl Drop for HookFlush<'_> {
    fn drop(&mut self) {
        self.0.flush_hooks();
    }
}

struct Inner {
    settings: CoreSettings,
    config_path: PathBuf,
    ready_pattern: Option<Regex>,
    runtime: Mutex<Runtime>,
    state_tx: watch::Sender<CoreState>,
    events: broadcast::Sender<CoreEvent>,
    logs: Mutex<LogRing>,
    hooks: RwLock<Vec<Arc<dyn StateHook>>>,
    /// 尚未通知钩子的状态变化
    hook_queue: Mutex<Vec<CoreState>>,
}

enum Step {
    Line(LogStream, Option<String>),
    Stop,
    Exited(std::io::Result<std::process::ExitStatus>),
}

/// 可克隆的监控器句柄，所有克隆共享同一个 core
#[derive(Clone)]
pub struct CoreSupervisor {
    inner: Arc<Inner>,
}

impl CoreSupervisor {
    pub fn new(settings: CoreSettings, config_path: impl Into<PathBuf>) -> Self {
        let ready_pattern = settings.ready_pattern.as_deref().and_then(|p| {
            Regex::new(p)
                .map_err(|e| tracing::warn!(pattern = p, error = %e, "invalid ready pattern ignored"))
                .ok()
        });
        let (state_tx, _) = watch::channel(CoreState::Stopped);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let runtime = Runtime {
            state: CoreState::Stopped,
            generation: 0,
            document: None,
            active: None,
            crashes: CrashWindow::new(settings.crash_threshold, settings.crash_window()),
            restarts: 0,
            started_at: None,
        };
        Self {
            inner: Arc::new(Inner {
                logs: Mutex::new(LogRing::new(settings.max_log_lines)),
                settings,
                config_path: config_path.into(),
                ready_pattern,
                runtime: Mutex::new(runtime),
                state_tx,
                events,
                hooks: RwLock::new(Vec::new()),
                hook_queue: Mutex::new(Vec::new()),
            }),
        }
    }

    /// 仅在 Stopped 时有效；返回时 core 已就绪
    pub async fn start(&self, doc: CoreConfigDocument) -> Result<CoreInstance, SupervisorError> {
        let inner = &self.inner;
        let doc = Arc::new(doc);
        let generation = {
            let mut rt = inner.lock();
            match rt.state {
                CoreState::Stopped => {}
                CoreState::CrashLoop => return Err(SupervisorError::CrashLoop),
                state => return Err(SupervisorError::InvalidState { op: "start", state }),
            }
            rt.generation += 1;
            rt.document = Some(Arc::clone(&doc));
            inner.set_state(&mut rt, CoreState::Starting);
            rt.generation
        };
        let staged = inner.stage(&doc).await;
        let ready = {
            let mut rt = inner.lock();
            if rt.generation != generation {
                return Err(SupervisorError::Launch("superseded before launch".into()));
            }
            match staged.and_then(|()| inner.launch(&mut rt)) {
                Ok(ready) => ready,
                Err(e) => {
                    inner.emit(CoreEvent::LaunchFailed {
                        reason: e.to_string(),
                    });
                    inner.set_state(&mut rt, CoreState::Stopped);
                    return Err(e);
                }
            }
        };
        match inner.await_ready(ready).await {
            Ok(()) => Ok(self.snapshot()),
            Err(reason) => Err(inner.fail_launch(generation, reason, false).await),
        }
    }

    /// 仅在 Starting / Running 时有效；先 SIGTERM，超时后强杀
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let inner = &self.inner;
        let active = {
            let mut rt = inner.lock();
            match rt.state {
                CoreState::Starting | CoreState::Running => {}
                state => return Err(SupervisorError::InvalidState { op: "stop", state }),
            }
            rt.generation += 1;
            inner.set_state(&mut rt, CoreState::Stopping);
            rt.active.take()
        };
        if let Some(active) = active {
            inner.shutdown(active).await;
        }
        let mut rt = inner.lock();
        rt.started_at = None;
        if rt.state == CoreState::Stopping {
            inner.set_state(&mut rt, CoreState::Stopped);
        }
        Ok(())
    }

    pub async fn restart(&self, doc: CoreConfigDocument) -> Result<CoreInstance, SupervisorError> {
        if self.state().is_active() {
            self.stop().await?;
        }
        self.start(doc).await
    }

    /// 内容哈希相同且正在运行时什么都不做；返回是否重启了
    pub async fn apply(&self, doc: CoreConfigDocument) -> Result<bool, SupervisorError> {
        {
            let rt = self.inner.lock();
            let same = rt
                .document
                .as_ref()
                .is_some_and(|current| current.hash() == doc.hash());
            if rt.state == CoreState::Running && same {
                tracing::debug!(hash = doc.hash(), "config unchanged, restart skipped");
                return Ok(false);
            }
        }
        self.restart(doc).await?;
        Ok(true)
    }

    /// 清空崩溃记录；CrashLoop 回到 Stopped
    pub fn reset(&self) -> Result<(), SupervisorError> {
        let inner = &self.inner;
        let mut rt = inner.lock();
        match rt.state {
            CoreState::CrashLoop | CoreState::Stopped => {}
            state => return Err(SupervisorError::InvalidState { op: "reset", state }),
        }
        rt.crashes.reset();
        rt.restarts = 0;
        if rt.state == CoreState::CrashLoop {
            tracing::info!("crash loop cleared");
            inner.set_state(&mut rt, CoreState::Stopped);
        }
        Ok(())
    }

    pub fn state(&self) -> CoreState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CoreInstance {
        let rt = self.inner.lock();
        CoreInstance {
            state: rt.state,
            pid: rt.active.as_ref().and_then(|a| a.pid),
            started_at: rt.started_at,
            restarts: rt.restarts,
            generation: rt.generation,
            config_hash: rt.document.as_ref().map(|d| d.hash().to_string()),
            profile_id: rt.document.as_ref().and_then(|d| d.profile_id()),
        }
    }

    /// 最近一次启动使用的文档
    pub fn document(&self) -> Option<Arc<CoreConfigDocument>> {
        self.inner.lock().document.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.inner.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<CoreState> {
        self.inner.state_tx.subscribe()
    }

    pub fn add_hook(&self, hook: Arc<dyn StateHook>) {
        self.inner
            .hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    pub fn logs(&self) -> Vec<LogLine> {
        self.inner.logs().lines()
    }

    pub fn log_tail(&self, n: usize) -> Vec<LogLine> {
        self.inner.logs().tail(n)
    }

    pub fn config_path(&self) -> &Path {
        &self.inner.config_path
    }

    pub fn settings(&self) -> &CoreSettings {
        &self.inner.settings
    }
}

impl Inner {
    fn lock(&self) -> RuntimeGuard<'_> {
        RuntimeGuard {
            rt: self.runtime.lock().unwrap_or_else(PoisonError::into_inner),
            _hooks: HookFlush(self),
        }
    }

    fn logs(&self) -> MutexGuard<'_, LogRing> {
        self.logs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: CoreEvent) {
        // 没有订阅者时发送失败，忽略
        let _ = self.events.send(event);
    }

    fn set_state(&self, rt: &mut Runtime, state: CoreState) {
        if rt.state == state {
            return;
        }
        let from = rt.state;
        rt.state = state;
        tracing::info!(from = %from, to = %state, generation = rt.generation, "core state changed");
        self.state_tx.send_replace(state);
        self.emit(CoreEvent::StateChanged {
            state,
            generation: rt.generation,
        });
        self.hook_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(state);
    }

    /// 运行时锁释放后调用
    fn flush_hooks(&self) {
        let states = std::mem::take(
            &mut *self.hook_queue.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if states.is_empty() {
            return;
        }
        let hooks = self
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for state in &states {
            for hook in &hooks {
                hook.on_state_change(*state);
            }
        }
    }

    /// 配置在阻塞线程池上落盘，不占用运行时锁
    async fn stage(&self, doc: &Arc<CoreConfigDocument>) -> Result<(), SupervisorError> {
        let doc = Arc::clone(doc);
        let path = self.config_path.clone();
        tokio::task::spawn_blocking(move || doc.write_to(&path))
            .await
            .map_err(|e| SupervisorError::Launch(format!("config staging task failed: {e}")))??;
        Ok(())
    }

    /// 拉起进程，配置须已由 [`Inner::stage`] 写好；就绪结果从返回的 receiver 得到
    fn launch(
        self: &Arc<Self>,
        rt: &mut Runtime,
    ) -> Result<oneshot::Receiver<Result<(), String>>, SupervisorError> {
        let doc = rt
            .document
            .clone()
            .ok_or_else(|| SupervisorError::Launch("no config document".into()))?;
        let child = process::spawn_core(&self.settings, &self.config_path).map_err(|e| {
            SupervisorError::Launch(format!(
                "failed to spawn {}: {e}",
                self.settings.binary.display()
            ))
        })?;
        let pid = child.id();
        let generation = rt.generation;
        let stop = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let done = tokio::spawn(Arc::clone(self).monitor(
            generation,
            child,
            doc,
            stop.clone(),
            ready_tx,
        ));
        rt.active = Some(Active {
            generation,
            pid,
            stop,
            done: Some(done),
            helpers: Vec::new(),
        });
        tracing::debug!(pid = ?pid, generation, config = %self.config_path.display(), "core spawned");
        Ok(ready_rx)
    }

    async fn await_ready(&self, ready: oneshot::Receiver<Result<(), String>>) -> Result<(), String> {
        let timeout = self.settings.ready_timeout();
        match tokio::time::timeout(timeout, ready).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err("core monitor ended unexpectedly".into()),
            Err(_) => Err(format!("core not ready within {}ms", timeout.as_millis())),
        }
    }

    /// 启动未能就绪：手动启动回到 Stopped，自动重启计为一次崩溃
    async fn fail_launch(self: &Arc<Self>, generation: u64, reason: String, auto: bool) -> SupervisorError {
        let active = {
            let mut rt = self.lock();
            if rt.generation != generation {
                return SupervisorError::Launch(format!("{reason} (superseded)"));
            }
            rt.active.take()
        };
        if let Some(active) = active {
            self.shutdown(active).await;
        }
        let mut rt = self.lock();
        if rt.generation != generation {
            return SupervisorError::Launch(reason);
        }
        rt.started_at = None;
        tracing::warn!(generation, reason = %reason, "core launch failed");
        self.emit(CoreEvent::LaunchFailed {
            reason: reason.clone(),
        });
        if auto {
            self.record_crash(&mut rt, generation, reason.clone());
        } else {
            self.set_state(&mut rt, CoreState::Stopped);
        }
        SupervisorError::Launch(reason)
    }

    async fn shutdown(&self, active: Active) {
        active.stop.cancel();
        process::kill_helpers(active.helpers);
        if let Some(done) = active.done {
            if let Err(e) = done.await {
                tracing::warn!(error = %e, "core monitor task failed");
            }
        }
    }

    fn record_crash(self: &Arc<Self>, rt: &mut Runtime, generation: u64, reason: String) {
        let crashes = rt.crashes.record(Instant::now());
        tracing::warn!(generation, crashes, reason = %reason, "core crashed");
        self.emit(CoreEvent::Crashed {
            generation,
            reason,
            crashes,
        });
        if rt.crashes.is_tripped(crashes) {
            tracing::error!(crashes, "core crash loop, auto-restart disabled until reset");
            self.set_state(rt, CoreState::CrashLoop);
            self.emit(CoreEvent::CrashLoop { crashes });
            return;
        }

        let delay = backoff_delay(
            Duration::from_millis(self.settings.backoff_base_ms),
            Duration::from_millis(self.settings.backoff_max_ms),
            crashes,
        );
        rt.generation += 1;
        let next = rt.generation;
        self.set_state(rt, CoreState::Starting);
        self.emit(CoreEvent::RestartScheduled {
            generation: next,
            delay,
        });
        tracing::info!(generation = next, delay_ms = delay.as_millis() as u64, "core restart scheduled");
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.restart_attempt(next).await;
        });
    }

    async fn restart_attempt(self: Arc<Self>, generation: u64) {
        let doc = {
            let rt = self.lock();
            if rt.generation != generation || rt.state != CoreState::Starting {
                tracing::debug!(generation, current = rt.generation, "stale restart ignored");
                return;
            }
            rt.document.clone()
        };
        let staged = match &doc {
            Some(doc) => self.stage(doc).await,
            None => Err(SupervisorError::Launch("no config document".into())),
        };
        let ready = {
            let mut rt = self.lock();
            if rt.generation != generation || rt.state != CoreState::Starting {
                tracing::debug!(generation, current = rt.generation, "stale restart ignored");
                return;
            }
            match staged.and_then(|()| self.launch(&mut rt)) {
                Ok(ready) => {
                    rt.restarts += 1;
                    ready
                }
                Err(e) => {
                    self.emit(CoreEvent::LaunchFailed {
                        reason: e.to_string(),
                    });
                    self.record_crash(&mut rt, generation, e.to_string());
                    return;
                }
            }
        };
        match self.await_ready(ready).await {
            Ok(()) => tracing::info!(generation, "core restarted"),
            Err(reason) => {
                self.fail_launch(generation, reason, true).await;
            }
        }
    }

    /// 就绪：拉起辅助程序并进入 Running
    fn promote(&self, generation: u64, doc: &CoreConfigDocument) -> Result<(), String> {
        let mut rt = self.lock();
        if rt.generation != generation || rt.state != CoreState::Starting {
            return Err("superseded before ready".into());
        }
        let mut helpers = Vec::new();
        for spec in doc.external() {
            match process::spawn_helper(spec) {
                Ok(child) => helpers.push(child),
                Err(e) => {
                    process::kill_helpers(helpers);
                    return Err(format!(
                        "failed to start helper for {} ({}): {e}",
                        spec.tag,
                        spec.program.display()
                    ));
                }
            }
        }
        if let Some(active) = rt.active.as_mut() {
            active.helpers = helpers;
        }
        rt.started_at = Some(unix_millis());
        self.set_state(&mut rt, CoreState::Running);
        Ok(())
    }

    fn ready_line(&self, text: &str, seen: &mut usize) -> bool {
        *seen += 1;
        match &self.ready_pattern {
            Some(re) => re.is_match(text),
            None => *seen >= self.settings.ready_lines,
        }
    }

    fn record_line(&self, generation: u64, stream: LogStream, text: String) {
        let line = LogLine {
            generation,
            stream,
            text,
            at: unix_millis(),
        };
        self.logs().push(line.clone());
        self.emit(CoreEvent::Log(line));
    }

    /// 进程退出（非 stop 请求）且已就绪
    fn on_exit(self: &Arc<Self>, generation: u64, exit: ExitInfo) {
        let mut rt = self.lock();
        if rt.active.as_ref().map(|a| a.generation) != Some(generation) {
            return;
        }
        if let Some(active) = rt.active.take() {
            process::kill_helpers(active.helpers);
        }
        rt.started_at = None;
        if rt.state != CoreState::Running {
            return;
        }
        if exit.success() {
            tracing::info!(generation, "core exited cleanly");
            self.set_state(&mut rt, CoreState::Stopped);
        } else {
            self.record_crash(&mut rt, generation, exit.to_string());
        }
    }

    async fn monitor(
        self: Arc<Self>,
        generation: u64,
        mut child: Child,
        doc: Arc<CoreConfigDocument>,
        stop: CancellationToken,
        ready_tx: oneshot::Sender<Result<(), String>>,
    ) {
        let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());
        let mut ready_tx = Some(ready_tx);
        let mut seen = 0usize;
        let mut requested = false;

        if self.ready_pattern.is_none() && self.settings.ready_lines == 0 {
            if let Some(tx) = ready_tx.take() {
                let result = self.promote(generation, &doc);
                requested = result.is_err();
                let _ = tx.send(result);
            }
        }

        let exit = loop {
            if requested {
                break process::terminate(&mut child, self.settings.stop_timeout()).await;
            }
            let step = tokio::select! {
                biased;
                _ = stop.cancelled() => Step::Stop,
                line = next_line(&mut stdout) => Step::Line(LogStream::Stdout, line),
                line = next_line(&mut stderr) => Step::Line(LogStream::Stderr, line),
                status = child.wait() => Step::Exited(status),
            };
            match step {
                Step::Stop => requested = true,
                Step::Line(LogStream::Stdout, None) => stdout = None,
                Step::Line(LogStream::Stderr, None) => stderr = None,
                Step::Line(stream, Some(text)) => {
                    let ready = ready_tx.is_some() && self.ready_line(&text, &mut seen);
                    self.record_line(generation, stream, text);
                    if ready {
                        if let Some(tx) = ready_tx.take() {
                            let result = self.promote(generation, &doc);
                            requested = result.is_err();
                            let _ = tx.send(result);
                        }
                    }
                }
                Step::Exited(status) => {
                    break match status {
                        Ok(status) => ExitInfo::from_status(status),
                        Err(e) => {
                            tracing::warn!(generation, error = %e, "waiting for core failed");
                            ExitInfo {
                                code: None,
                                signal: None,
                            }
                        }
                    };
                }
            }
        };

        if !requested {
            self.drain(generation, LogStream::Stdout, &mut stdout).await;
            self.drain(generation, LogStream::Stderr, &mut stderr).await;
        }
        tracing::debug!(generation, exit = %exit, requested, "core process ended");
        if let Some(tx) = ready_tx.take() {
            let reason = if requested {
                "stopped before ready".to_string()
            } else {
                format!("core exited before ready ({exit})")
            };
            let _ = tx.send(Err(reason));
        } else if !requested {
            self.on_exit(generation, exit);
        }
    }
}

impl Inner {
    /// 进程退出后收走管道里剩下的输出
    async fn drain<R: AsyncBufRead + Unpin>(
        &self,
        generation: u64,
        stream: LogStream,
        lines: &mut Option<Lines<R>>,
    ) {
        let Some(lines) = lines.as_mut() else {
            return;
        };
        // 孙进程可能继承了管道，不能无限等 EOF
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while let Ok(Some(text)) = lines.next_line().await {
                self.record_line(generation, stream, text);
            }
        })
        .await;
    }
}

async fn next_line<R: AsyncBufRead + Unpin>(lines: &mut Option<Lines<R>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}
