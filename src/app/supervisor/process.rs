//! 子进程启动与终止

use std::fmt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::builder::ExternalProcessSpec;
use crate::config::types::CoreSettings;

/// 子进程退出方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }

    /// 退出码 0 视为正常退出
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "signal {sig}"),
            (None, None) => f.write_str("unknown exit"),
        }
    }
}

/// 把 `{config}` 占位符替换为配置路径
pub fn render_args(args: &[String], config_path: &Path) -> Vec<String> {
    let path = config_path.display().to_string();
    args.iter().map(|a| a.replace("{config}", &path)).collect()
}

pub fn spawn_core(settings: &CoreSettings, config_path: &Path) -> std::io::Result<Child> {
    let mut cmd = Command::new(&settings.binary);
    cmd.args(render_args(&settings.args, config_path))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &settings.working_dir {
        cmd.current_dir(dir);
    }
    cmd.spawn()
}

/// 辅助程序输出不进日志缓冲
pub fn spawn_helper(spec: &ExternalProcessSpec) -> std::io::Result<Child> {
    Command::new(&spec.program)
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
}

pub fn kill_helpers(helpers: Vec<Child>) {
    for mut helper in helpers {
        let pid = helper.id();
        if let Err(e) = helper.start_kill() {
            tracing::debug!(pid = ?pid, error = %e, "helper already gone");
        }
    }
}

/// 先发 SIGTERM，超时后强杀
pub async fn terminate(child: &mut Child, timeout: Duration) -> ExitInfo {
    if let Ok(Some(status)) = child.try_wait() {
        return ExitInfo::from_status(status);
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid 属于尚未回收的子进程
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => return ExitInfo::from_status(status),
            Ok(Err(e)) => tracing::warn!(pid, error = %e, "waiting for core failed"),
            Err(_) => tracing::warn!(pid, "core ignored SIGTERM, killing"),
        }
    }
    #[cfg(not(unix))]
    let _ = timeout;

    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "kill failed");
    }
    match child.wait().await {
        Ok(status) => ExitInfo::from_status(status),
        Err(_) => ExitInfo {
            code: None,
            signal: None,
        },
    }
}
