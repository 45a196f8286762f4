use serde::{Deserialize, Serialize};

use super::{GroupId, ProfileId, SniffingMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    #[default]
    Basic,
    Subscription,
    Archive,
}

fn default_true() -> bool {
    true
}

/// 订阅地址与拉取选项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSource {
    pub url: String,
    /// 通过当前运行的 core 拉取
    #[serde(default)]
    pub use_proxy: bool,
    #[serde(default)]
    pub ignore_tls_errors: bool,
    /// 更新时无条件删除远端已不存在的成员
    #[serde(default)]
    pub clear_before_update: bool,
    /// 远端已不存在的成员保留并标记 stale
    #[serde(default = "default_true")]
    pub never_clear: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl SubscriptionSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            use_proxy: false,
            ignore_tls_errors: false,
            clear_before_update: false,
            never_clear: true,
            user_agent: None,
        }
    }
}

/// 响应头中携带的订阅信息
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionInfo {
    pub title: Option<String>,
    pub upload: Option<u64>,
    pub download: Option<u64>,
    pub total: Option<u64>,
    /// Unix 秒
    pub expire: Option<u64>,
}

impl SubscriptionInfo {
    pub fn is_empty(&self) -> bool {
        *self == SubscriptionInfo::default()
    }

    pub fn remaining(&self) -> Option<u64> {
        let used = self.upload.unwrap_or(0) + self.download.unwrap_or(0);
        self.total.map(|t| t.saturating_sub(used))
    }
}

/// 组级别覆盖项，仅在 `apply` 为 true 时生效
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupOverrides {
    pub apply: bool,
    /// 链路最前面的一跳
    pub front_proxy: Option<ProfileId>,
    /// 链路最后一跳
    pub landing_proxy: Option<ProfileId>,
    pub sniffing: Option<SniffingMode>,
    pub outbound_domain_strategy: Option<String>,
    pub default_outbound: Option<String>,
    pub remote_dns: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub kind: GroupKind,
    #[serde(default)]
    pub members: Vec<ProfileId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionSource>,
    /// Unix 秒
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<u64>,
    /// 自动更新间隔（分钟），0 关闭
    #[serde(default)]
    pub auto_update_mins: u32,
    #[serde(default)]
    pub overrides: GroupOverrides,
    #[serde(default, skip_serializing_if = "SubscriptionInfo::is_empty")]
    pub info: SubscriptionInfo,
}

impl Group {
    pub fn new(id: GroupId, name: impl Into<String>, kind: GroupKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            members: Vec::new(),
            subscription: None,
            last_update: None,
            auto_update_mins: 0,
            overrides: GroupOverrides::default(),
            info: SubscriptionInfo::default(),
        }
    }

    pub fn label(&self) -> String {
        format!("group #{} {}", self.id, self.name)
    }

    /// 生效中的覆盖项
    pub fn active_overrides(&self) -> Option<&GroupOverrides> {
        self.overrides.apply.then_some(&self.overrides)
    }

    /// 到期需要自动更新
    pub fn update_due(&self, now_secs: u64) -> bool {
        if self.kind != GroupKind::Subscription
            || self.subscription.is_none()
            || self.auto_update_mins == 0
        {
            return false;
        }
        match self.last_update {
            None => true,
            Some(last) => now_secs.saturating_sub(last) >= u64::from(self.auto_update_mins) * 60,
        }
    }
}
