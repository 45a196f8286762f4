use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// 应用设置（`corewarden.yaml`）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub core: CoreSettings,
    #[serde(default)]
    pub inbound: InboundSettings,
    #[serde(default)]
    pub test: TestSettings,
    #[serde(default)]
    pub subscription: SubscriptionSettings,
    /// 辅助程序名 → 可执行文件路径，如 `naive`
    #[serde(default)]
    pub extra_cores: BTreeMap<String, PathBuf>,
    #[serde(default = "default_external_port_base")]
    pub external_port_base: u16,
    #[serde(default)]
    pub clash_api: Option<ClashApiSettings>,
    #[serde(default)]
    pub mux: MuxSettings,
    #[serde(default)]
    pub ntp: NtpSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log: LogSettings::default(),
            data_dir: default_data_dir(),
            core: CoreSettings::default(),
            inbound: InboundSettings::default(),
            test: TestSettings::default(),
            subscription: SubscriptionSettings::default(),
            extra_cores: BTreeMap::new(),
            external_port_base: default_external_port_base(),
            clash_api: None,
            mux: MuxSettings::default(),
            ntp: NtpSettings::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.core.binary.as_os_str().is_empty() {
            anyhow::bail!("core.binary must not be empty");
        }
        if self.core.crash_threshold == 0 {
            anyhow::bail!("core.crash_threshold must be at least 1");
        }
        if self.core.crash_window_secs == 0 {
            anyhow::bail!("core.crash_window_secs must be at least 1");
        }
        if self.core.max_log_lines == 0 {
            anyhow::bail!("core.max_log_lines must be at least 1");
        }
        if self.test.concurrency == 0 {
            anyhow::bail!("test.concurrency must be at least 1");
        }
        if self.test.timeout_ms == 0 {
            anyhow::bail!("test.timeout_ms must be at least 1");
        }
        if self.inbound.address.parse::<IpAddr>().is_err() {
            anyhow::bail!(
                "inbound.address '{}' is not an IP address",
                self.inbound.address
            );
        }
        if self.inbound.mixed_port == 0 {
            anyhow::bail!("inbound.mixed_port must not be 0");
        }
        if let Some(api) = &self.clash_api {
            if api.listen.parse::<IpAddr>().is_err() {
                anyhow::bail!("clash_api.listen '{}' is not an IP address", api.listen);
            }
        }
        if !matches!(self.mux.protocol.as_str(), "h2mux" | "smux" | "yamux") {
            anyhow::bail!("mux.protocol '{}' is not one of h2mux, smux, yamux", self.mux.protocol);
        }
        if self.ntp.enabled {
            if self.ntp.server.trim().is_empty() {
                anyhow::bail!("ntp.server must not be empty when ntp is enabled");
            }
            if self.ntp.server_port == 0 {
                anyhow::bail!("ntp.server_port must not be 0");
            }
        }
        if let Some(pattern) = &self.core.ready_pattern {
            regex::Regex::new(pattern)
                .map_err(|e| anyhow::anyhow!("core.ready_pattern is not a valid regex: {e}"))?;
        }
        Ok(())
    }

    pub fn profiles_path(&self) -> PathBuf {
        self.data_dir.join("profiles.json")
    }

    pub fn routes_path(&self) -> PathBuf {
        self.data_dir.join("routes.json")
    }

    /// core 读取的配置文件
    pub fn core_config_path(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    pub fn rule_set_dir(&self) -> PathBuf {
        self.data_dir.join("rule_sets")
    }

    /// 一次性测速 core 的工作目录
    pub fn probe_dir(&self) -> PathBuf {
        self.data_dir.join("probe")
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_external_port_base() -> u16 {
    20000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    /// 控制面自身的 tracing 过滤
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 写入生成配置的 core 日志级别
    #[serde(default = "default_core_log_level")]
    pub core_level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            core_level: default_core_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_core_log_level() -> String {
    "warn".to_string()
}

/// 出站多路复用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuxSettings {
    /// 未单独设置的 profile 是否开启
    #[serde(default)]
    pub default_on: bool,
    #[serde(default = "default_mux_protocol")]
    pub protocol: String,
    /// 单连接最大流数，0 表示全局关闭
    #[serde(default = "default_mux_max_streams")]
    pub max_streams: u32,
    #[serde(default)]
    pub padding: bool,
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self {
            default_on: false,
            protocol: default_mux_protocol(),
            max_streams: default_mux_max_streams(),
            padding: false,
        }
    }
}

fn default_mux_protocol() -> String {
    "h2mux".to_string()
}

fn default_mux_max_streams() -> u32 {
    8
}

/// core 内置的 NTP 校时
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NtpSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ntp_server")]
    pub server: String,
    #[serde(default = "default_ntp_port")]
    pub server_port: u16,
    /// 如 `30m`
    #[serde(default = "default_ntp_interval")]
    pub interval: String,
}

impl Default for NtpSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            server: default_ntp_server(),
            server_port: default_ntp_port(),
            interval: default_ntp_interval(),
        }
    }
}

fn default_ntp_server() -> String {
    "time.apple.com".to_string()
}

fn default_ntp_port() -> u16 {
    123
}

fn default_ntp_interval() -> String {
    "30m".to_string()
}

/// core 进程与监控参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreSettings {
    #[serde(default = "default_core_binary")]
    pub binary: PathBuf,
    /// `{config}` 会被替换为配置文件路径
    #[serde(default = "default_core_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_ready_lines")]
    pub ready_lines: usize,
    #[serde(default)]
    pub ready_pattern: Option<String>,
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// 窗口内崩溃达到该次数进入 CrashLoop
    #[serde(default = "default_crash_threshold")]
    pub crash_threshold: usize,
    #[serde(default = "default_crash_window_secs")]
    pub crash_window_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_max_log_lines")]
    pub max_log_lines: usize,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            binary: default_core_binary(),
            args: default_core_args(),
            working_dir: None,
            ready_lines: default_ready_lines(),
            ready_pattern: None,
            ready_timeout_ms: default_ready_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            crash_threshold: default_crash_threshold(),
            crash_window_secs: default_crash_window_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_log_lines: default_max_log_lines(),
        }
    }
}

impl CoreSettings {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn crash_window(&self) -> Duration {
        Duration::from_secs(self.crash_window_secs)
    }
}

fn default_core_binary() -> PathBuf {
    PathBuf::from("sing-box")
}
fn default_core_args() -> Vec<String> {
    vec!["run".into(), "-c".into(), "{config}".into()]
}
fn default_ready_lines() -> usize {
    1
}
fn default_ready_timeout_ms() -> u64 {
    5000
}
fn default_stop_timeout_ms() -> u64 {
    3000
}
fn default_crash_threshold() -> usize {
    3
}
fn default_crash_window_secs() -> u64 {
    60
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_max_log_lines() -> usize {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundSettings {
    #[serde(default = "default_inbound_address")]
    pub address: String,
    #[serde(default = "default_mixed_port")]
    pub mixed_port: u16,
    #[serde(default)]
    pub tun: TunSettings,
}

impl Default for InboundSettings {
    fn default() -> Self {
        Self {
            address: default_inbound_address(),
            mixed_port: default_mixed_port(),
            tun: TunSettings::default(),
        }
    }
}

fn default_inbound_address() -> String {
    "127.0.0.1".to_string()
}

fn default_mixed_port() -> u16 {
    2080
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunSettings {
    /// 启动时是否开启 TUN，运行中由 App 切换
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_tun_name")]
    pub interface_name: String,
    #[serde(default = "default_tun_mtu")]
    pub mtu: u32,
    #[serde(default = "default_tun_stack")]
    pub stack: String,
    #[serde(default = "default_true")]
    pub strict_route: bool,
    #[serde(default)]
    pub ipv6: bool,
}

impl Default for TunSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interface_name: default_tun_name(),
            mtu: default_tun_mtu(),
            stack: default_tun_stack(),
            strict_route: true,
            ipv6: false,
        }
    }
}

fn default_tun_name() -> String {
    "corewarden-tun".to_string()
}
fn default_tun_mtu() -> u32 {
    9000
}
fn default_tun_stack() -> String {
    "mixed".to_string()
}
fn default_true() -> bool {
    true
}

/// 测速参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSettings {
    #[serde(default = "default_test_url")]
    pub url: String,
    #[serde(default = "default_test_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_test_timeout_ms")]
    pub timeout_ms: u64,
    /// 取消后给在途探测的宽限时间
    #[serde(default = "default_test_grace_ms")]
    pub grace_ms: u64,
}

impl Default for TestSettings {
    fn default() -> Self {
        Self {
            url: default_test_url(),
            concurrency: default_test_concurrency(),
            timeout_ms: default_test_timeout_ms(),
            grace_ms: default_test_grace_ms(),
        }
    }
}

fn default_test_url() -> String {
    "http://cp.cloudflare.com/".to_string()
}
fn default_test_concurrency() -> usize {
    5
}
fn default_test_timeout_ms() -> u64 {
    3000
}
fn default_test_grace_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSettings {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_fetch_timeout_ms")]
    pub timeout_ms: u64,
    /// 自动更新检查间隔
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_ms: default_fetch_timeout_ms(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

fn default_user_agent() -> String {
    concat!("corewarden/", env!("CARGO_PKG_VERSION")).to_string()
}
fn default_fetch_timeout_ms() -> u64 {
    15_000
}
fn default_check_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClashApiSettings {
    #[serde(default = "default_inbound_address")]
    pub listen: String,
    #[serde(default = "default_clash_api_port")]
    pub port: u16,
    #[serde(default)]
    pub secret: String,
}

fn default_clash_api_port() -> u16 {
    9090
}
