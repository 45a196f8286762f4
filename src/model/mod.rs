//! 控制面数据模型
//!
//! Profile / Group / RoutingProfile 以及测速结果。所有实体都可序列化，
//! 由 `store` 模块按 id 有序持久化。

pub mod bean;
pub mod group;
pub mod routing;
pub mod transport;

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use bean::{ProtocolBean, ProtocolKind, ProxyBean};
pub use group::{Group, GroupKind, GroupOverrides, SubscriptionInfo, SubscriptionSource};
pub use routing::{DnsSettings, RouteRule, RoutingProfile, RuleOutbound, SniffingMode};
pub use transport::TransportSettings;

pub type ProfileId = u64;
pub type GroupId = u64;
pub type RouteId = u64;

/// Profile 的来源，决定订阅同步是否可以改动它
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileOrigin {
    #[default]
    Manual,
    Subscription,
}

/// 单个 profile 的多路复用开关
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MuxState {
    /// 跟随全局 `mux.default_on`
    #[default]
    Default,
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrafficCounters {
    pub upload: u64,
    pub download: u64,
}

/// 单个代理端点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: ProfileId,
    pub name: String,
    /// 用户手动设置的显示名，订阅更新时保留
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupId>,
    #[serde(default)]
    pub origin: ProfileOrigin,
    pub bean: ProxyBean,
    /// 深度合并进该 profile 生成的 outbound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_outbound: Option<serde_json::Value>,
    #[serde(default)]
    pub mux: MuxState,
    /// 深度合并进整个生成的配置文档
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_config: Option<serde_json::Value>,
    /// 订阅中已不存在但被保留
    #[serde(default)]
    pub stale: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_test: Option<TestResult>,
    #[serde(default)]
    pub traffic: TrafficCounters,
}

impl Profile {
    pub fn new(id: ProfileId, name: impl Into<String>, bean: ProxyBean) -> Self {
        Self {
            id,
            name: name.into(),
            name_override: None,
            group: None,
            origin: ProfileOrigin::Manual,
            bean,
            custom_outbound: None,
            mux: MuxState::Default,
            custom_config: None,
            stale: false,
            last_test: None,
            traffic: TrafficCounters::default(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name_override.as_deref().unwrap_or(&self.name)
    }

    /// 协议类型 + 规范化的连接参数，订阅 diff 用它识别"同一个节点"
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::of(&self.bean)
    }

    /// 用于日志与错误信息的实体标识
    pub fn label(&self) -> String {
        format!("#{} {}", self.id, self.display_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// 每段前缀长度，字段内容里出现分隔符也不会与别的组合相撞
    pub fn of(bean: &ProxyBean) -> Self {
        let protocol = bean.protocol();
        let mut key = protocol.kind().as_str().to_string();
        for part in protocol.identity_params() {
            key.push('|');
            key.push_str(&part.len().to_string());
            key.push(':');
            key.push_str(&part);
        }
        IdentityKey(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 一条校验失败：哪个实体的哪个字段，为什么
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldIssue {
    pub entity: String,
    pub field: String,
    pub message: String,
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.entity, self.field, self.message)
    }
}

/// 校验过程中收集问题，不在第一个错误处停下
#[derive(Debug, Default)]
pub struct Issues {
    entity: String,
    items: Vec<FieldIssue>,
}

impl Issues {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            items: Vec::new(),
        }
    }

    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.items.push(FieldIssue {
            entity: self.entity.clone(),
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn require(&mut self, field: &str, value: &str) {
        if value.trim().is_empty() {
            self.push(field, "required");
        }
    }

    pub fn require_port(&mut self, field: &str, port: u16) {
        if port == 0 {
            self.push(field, "must be in 1..=65535");
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_vec(self) -> Vec<FieldIssue> {
        self.items
    }

    pub fn extend(&mut self, other: Issues) {
        self.items.extend(other.items);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestErrorKind {
    Timeout,
    Connect,
    Tls,
    Config,
    Cancelled,
    Other,
}

impl TestErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TestErrorKind::Timeout => "TIMEOUT",
            TestErrorKind::Connect => "CONNECT",
            TestErrorKind::Tls => "TLS",
            TestErrorKind::Config => "CONFIG",
            TestErrorKind::Cancelled => "CANCELLED",
            TestErrorKind::Other => "OTHER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TestOutcome {
    Latency { latency: Duration },
    Failed { kind: TestErrorKind, message: String },
}

/// 单个 profile 的测速结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub profile_id: ProfileId,
    pub outcome: TestOutcome,
    /// Unix 毫秒
    pub tested_at: u64,
    pub session: Uuid,
}

impl TestResult {
    pub fn latency(&self) -> Option<Duration> {
        match &self.outcome {
            TestOutcome::Latency { latency } => Some(*latency),
            TestOutcome::Failed { .. } => None,
        }
    }

    pub fn error_kind(&self) -> Option<TestErrorKind> {
        match &self.outcome {
            TestOutcome::Latency { .. } => None,
            TestOutcome::Failed { kind, .. } => Some(*kind),
        }
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub(crate) fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
