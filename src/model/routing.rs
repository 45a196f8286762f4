//! 路由配置：规则列表、DNS、嗅探与域名策略

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{Issues, ProfileId, RouteId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SniffingMode {
    Disable,
    /// 嗅探结果只用于路由匹配
    #[default]
    ForRouting,
    /// 嗅探出的域名覆盖连接目标
    ForDestination,
}

/// 规则命中后的出站
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOutbound {
    Proxy,
    Direct,
    Block,
    DnsOut,
    /// 直接使用某个 profile 作为出站
    Profile(ProfileId),
}

impl RuleOutbound {
    /// 内置出站的 tag；`Profile` 由生成器分配
    pub fn builtin_tag(self) -> Option<&'static str> {
        match self {
            RuleOutbound::Proxy => Some("proxy"),
            RuleOutbound::Direct => Some("direct"),
            RuleOutbound::Block => Some("block"),
            RuleOutbound::DnsOut => Some("dns-out"),
            RuleOutbound::Profile(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteRule {
    pub name: String,
    pub ip_version: Option<u8>,
    pub network: String,
    pub protocol: Vec<String>,
    pub inbound: Vec<String>,
    pub domain: Vec<String>,
    pub domain_suffix: Vec<String>,
    pub domain_keyword: Vec<String>,
    pub domain_regex: Vec<String>,
    pub source_ip_cidr: Vec<String>,
    pub source_ip_is_private: bool,
    pub ip_cidr: Vec<String>,
    pub ip_is_private: bool,
    pub source_port: Vec<u16>,
    /// `起:止`，两端都可省略
    pub source_port_range: Vec<String>,
    pub port: Vec<u16>,
    pub port_range: Vec<String>,
    pub process_name: Vec<String>,
    pub process_path: Vec<String>,
    pub process_path_regex: Vec<String>,
    pub rule_set: Vec<String>,
    pub invert: bool,
    pub outbound: RuleOutbound,
}

impl Default for RouteRule {
    fn default() -> Self {
        Self {
            name: String::new(),
            ip_version: None,
            network: String::new(),
            protocol: Vec::new(),
            inbound: Vec::new(),
            domain: Vec::new(),
            domain_suffix: Vec::new(),
            domain_keyword: Vec::new(),
            domain_regex: Vec::new(),
            source_ip_cidr: Vec::new(),
            source_ip_is_private: false,
            ip_cidr: Vec::new(),
            ip_is_private: false,
            source_port: Vec::new(),
            source_port_range: Vec::new(),
            port: Vec::new(),
            port_range: Vec::new(),
            process_name: Vec::new(),
            process_path: Vec::new(),
            process_path_regex: Vec::new(),
            rule_set: Vec::new(),
            invert: false,
            outbound: RuleOutbound::Direct,
        }
    }
}

impl RouteRule {
    /// 没有任何匹配条件
    pub fn is_empty(&self) -> bool {
        self.ip_version.is_none()
            && self.network.is_empty()
            && self.protocol.is_empty()
            && self.inbound.is_empty()
            && self.domain.is_empty()
            && self.domain_suffix.is_empty()
            && self.domain_keyword.is_empty()
            && self.domain_regex.is_empty()
            && self.source_ip_cidr.is_empty()
            && !self.source_ip_is_private
            && self.ip_cidr.is_empty()
            && !self.ip_is_private
            && self.source_port.is_empty()
            && self.source_port_range.is_empty()
            && self.port.is_empty()
            && self.port_range.is_empty()
            && self.process_name.is_empty()
            && self.process_path.is_empty()
            && self.process_path_regex.is_empty()
            && self.rule_set.is_empty()
    }

    pub fn validate(&self, index: usize, issues: &mut Issues) {
        let field = |name: &str| format!("rules[{index}].{name}");
        if self.is_empty() {
            issues.push(format!("rules[{index}]"), "rule has no match condition");
        }
        if let Some(v) = self.ip_version {
            if v != 4 && v != 6 {
                issues.push(field("ip_version"), "must be 4 or 6");
            }
        }
        if !matches!(self.network.as_str(), "" | "tcp" | "udp") {
            issues.push(field("network"), format!("unknown network '{}'", self.network));
        }
        for (name, patterns) in [
            ("domain_regex", &self.domain_regex),
            ("process_path_regex", &self.process_path_regex),
        ] {
            for re in patterns {
                if let Err(e) = regex::Regex::new(re) {
                    issues.push(field(name), format!("invalid regex '{re}': {e}"));
                }
            }
        }
        for (name, ranges) in [
            ("source_port_range", &self.source_port_range),
            ("port_range", &self.port_range),
        ] {
            for range in ranges {
                if !valid_port_range(range) {
                    issues.push(field(name), format!("invalid range '{range}'"));
                }
            }
        }
        for (name, ports) in [("source_port", &self.source_port), ("port", &self.port)] {
            if ports.contains(&0) {
                issues.push(field(name), "port 0 is not valid");
            }
        }
    }

    /// 转成 core 的路由规则，`outbound_tag` 由生成器解析
    pub fn to_json(&self, outbound_tag: &str) -> Value {
        let mut r = Map::new();
        if let Some(v) = self.ip_version {
            r.insert("ip_version".into(), json!(v));
        }
        if !self.network.is_empty() {
            r.insert("network".into(), json!(self.network));
        }
        let lists: [(&str, &Vec<String>); 14] = [
            ("protocol", &self.protocol),
            ("inbound", &self.inbound),
            ("domain", &self.domain),
            ("domain_suffix", &self.domain_suffix),
            ("domain_keyword", &self.domain_keyword),
            ("domain_regex", &self.domain_regex),
            ("source_ip_cidr", &self.source_ip_cidr),
            ("ip_cidr", &self.ip_cidr),
            ("source_port_range", &self.source_port_range),
            ("port_range", &self.port_range),
            ("process_name", &self.process_name),
            ("process_path", &self.process_path),
            ("process_path_regex", &self.process_path_regex),
            ("rule_set", &self.rule_set),
        ];
        for (key, values) in lists {
            if !values.is_empty() {
                r.insert(key.into(), json!(values));
            }
        }
        for (key, ports) in [("source_port", &self.source_port), ("port", &self.port)] {
            if !ports.is_empty() {
                r.insert(key.into(), json!(ports));
            }
        }
        for (key, set) in [
            ("source_ip_is_private", self.source_ip_is_private),
            ("ip_is_private", self.ip_is_private),
        ] {
            if set {
                r.insert(key.into(), json!(true));
            }
        }
        if self.invert {
            r.insert("invert".into(), json!(true));
        }
        r.insert("outbound".into(), json!(outbound_tag));
        Value::Object(r)
    }
}

fn valid_port_range(range: &str) -> bool {
    let Some((lo, hi)) = range.split_once(':') else {
        return false;
    };
    let lo = if lo.is_empty() { Some(1) } else { lo.parse::<u16>().ok() };
    let hi = if hi.is_empty() { Some(u16::MAX) } else { hi.parse::<u16>().ok() };
    matches!((lo, hi), (Some(l), Some(h)) if l >= 1 && l <= h)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsFinal {
    #[default]
    Remote,
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimpleDns {
    pub remote: String,
    pub remote_strategy: String,
    pub direct: String,
    pub direct_strategy: String,
    #[serde(rename = "final")]
    pub final_server: DnsFinal,
}

impl Default for SimpleDns {
    fn default() -> Self {
        Self {
            remote: "https://8.8.8.8/dns-query".into(),
            remote_strategy: String::new(),
            direct: "localhost".into(),
            direct_strategy: String::new(),
            final_server: DnsFinal::Remote,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DnsSettings {
    Simple(SimpleDns),
    /// 原样使用的 DNS 对象
    Object { object: Value },
}

impl Default for DnsSettings {
    fn default() -> Self {
        DnsSettings::Simple(SimpleDns::default())
    }
}

fn default_outbound() -> String {
    "proxy".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingProfile {
    pub id: RouteId,
    pub name: String,
    #[serde(default)]
    pub rules: Vec<RouteRule>,
    #[serde(default)]
    pub dns: DnsSettings,
    #[serde(default)]
    pub sniffing: SniffingMode,
    /// proxy / direct / block
    #[serde(default = "default_outbound")]
    pub default_outbound: String,
    /// 入站域名策略，空串表示不设置
    #[serde(default)]
    pub domain_strategy: String,
    /// 出站（代理服务器地址）的域名策略
    #[serde(default)]
    pub outbound_domain_strategy: String,
    #[serde(default)]
    pub fake_ip: bool,
}

impl RoutingProfile {
    pub fn new(id: RouteId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            rules: Vec::new(),
            dns: DnsSettings::default(),
            sniffing: SniffingMode::default(),
            default_outbound: default_outbound(),
            domain_strategy: String::new(),
            outbound_domain_strategy: String::new(),
            fake_ip: false,
        }
    }

    /// 首次启动时的默认路由：DNS 交给 dns-out，私有地址直连
    pub fn builtin_default(id: RouteId) -> Self {
        let mut route = Self::new(id, "Default");
        route.rules = vec![
            RouteRule {
                name: "dns".into(),
                protocol: vec!["dns".into()],
                outbound: RuleOutbound::DnsOut,
                ..Default::default()
            },
            RouteRule {
                name: "private".into(),
                ip_is_private: true,
                outbound: RuleOutbound::Direct,
                ..Default::default()
            },
        ];
        route
    }

    pub fn label(&self) -> String {
        format!("route #{} {}", self.id, self.name)
    }

    /// 规则引用到的 profile，按首次出现顺序去重
    pub fn used_profiles(&self) -> Vec<ProfileId> {
        let mut seen = BTreeSet::new();
        self.rules
            .iter()
            .filter_map(|r| match r.outbound {
                RuleOutbound::Profile(id) => Some(id),
                _ => None,
            })
            .filter(|id| seen.insert(*id))
            .collect()
    }

    pub fn used_rule_sets(&self) -> BTreeSet<String> {
        self.rules
            .iter()
            .flat_map(|r| r.rule_set.iter().cloned())
            .collect()
    }

    /// 走直连的域名条件，用于 direct DNS 规则
    pub fn direct_domains(&self) -> Map<String, Value> {
        let mut out = Map::new();
        let mut push = |key: &str, values: &[String]| {
            if values.is_empty() {
                return;
            }
            let entry = out.entry(key.to_string()).or_insert_with(|| json!([]));
            if let Value::Array(arr) = entry {
                arr.extend(values.iter().map(|v| json!(v)));
            }
        };
        for rule in self
            .rules
            .iter()
            .filter(|r| r.outbound == RuleOutbound::Direct && !r.invert)
        {
            push("domain", &rule.domain);
            push("domain_suffix", &rule.domain_suffix);
            push("domain_keyword", &rule.domain_keyword);
            push("domain_regex", &rule.domain_regex);
        }
        out
    }

    pub fn validate(&self, issues: &mut Issues) {
        for (i, rule) in self.rules.iter().enumerate() {
            rule.validate(i, issues);
        }
        if !matches!(self.default_outbound.as_str(), "proxy" | "direct" | "block") {
            issues.push(
                "default_outbound",
                format!("unknown outbound '{}'", self.default_outbound),
            );
        }
        if let DnsSettings::Object { object } = &self.dns {
            if !object.is_object() {
                issues.push("dns.object", "must be a JSON object");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_rule_is_invalid() {
        let mut route = RoutingProfile::new(1, "r");
        route.rules.push(RouteRule::default());
        let mut issues = Issues::new("r");
        route.validate(&mut issues);
        let fields: Vec<_> = issues.into_vec().into_iter().map(|i| i.field).collect();
        assert_eq!(fields, vec!["rules[0]"]);
    }

    #[test]
    fn bad_regex_and_range_reported() {
        let mut route = RoutingProfile::new(1, "r");
        route.rules.push(RouteRule {
            domain_regex: vec!["(".into()],
            port_range: vec!["90:80".into()],
            ..Default::default()
        });
        let mut issues = Issues::new("r");
        route.validate(&mut issues);
        let fields: Vec<_> = issues.into_vec().into_iter().map(|i| i.field).collect();
        assert_eq!(
            fields,
            vec!["rules[0].domain_regex", "rules[0].port_range"]
        );
    }

    #[test]
    fn rule_json_only_has_set_fields() {
        let rule = RouteRule {
            domain_suffix: vec!["example.com".into()],
            port: vec![443],
            outbound: RuleOutbound::Block,
            ..Default::default()
        };
        let v = rule.to_json("block");
        let obj = v.as_object().unwrap();
        let keys: Vec<_> = obj.keys().cloned().collect();
        assert_eq!(keys, vec!["domain_suffix", "outbound", "port"]);
    }

    #[test]
    fn source_and_process_conditions() {
        let rule = RouteRule {
            source_ip_is_private: true,
            source_port: vec![5353],
            source_port_range: vec!["1000:2000".into()],
            process_path_regex: vec![r"^/usr/bin/.+".into()],
            outbound: RuleOutbound::Direct,
            ..Default::default()
        };
        assert!(!rule.is_empty());
        let v = rule.to_json("direct");
        assert_eq!(v["source_ip_is_private"], true);
        assert_eq!(v["source_port"], json!([5353]));
        assert_eq!(v["source_port_range"], json!(["1000:2000"]));
        assert_eq!(v["process_path_regex"], json!(["^/usr/bin/.+"]));
        assert!(v.get("ip_is_private").is_none());

        let broken = RouteRule {
            source_port: vec![0],
            source_port_range: vec!["9:1".into()],
            process_path_regex: vec!["[".into()],
            ..Default::default()
        };
        let mut issues = Issues::new("r");
        broken.validate(0, &mut issues);
        let fields: Vec<_> = issues.into_vec().into_iter().map(|i| i.field).collect();
        assert_eq!(
            fields,
            vec![
                "rules[0].process_path_regex",
                "rules[0].source_port_range",
                "rules[0].source_port"
            ]
        );
    }

    #[test]
    fn used_profiles_dedup_in_order() {
        let mut route = RoutingProfile::new(1, "r");
        for id in [7, 3, 7] {
            route.rules.push(RouteRule {
                domain: vec!["x".into()],
                outbound: RuleOutbound::Profile(id),
                ..Default::default()
            });
        }
        assert_eq!(route.used_profiles(), vec![7, 3]);
    }

    #[test]
    fn port_range_forms() {
        assert!(valid_port_range("1000:2000"));
        assert!(valid_port_range(":2000"));
        assert!(valid_port_range("1000:"));
        assert!(!valid_port_range("2000"));
        assert!(!valid_port_range("a:b"));
    }
}
