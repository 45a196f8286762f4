//! 协议参数（bean）
//!
//! 每种协议一个变体，统一实现 [`ProtocolBean`]：校验、生成 outbound 片段、
//! 生成分享链接、给出身份参数。调用方只通过 `ProxyBean::protocol()` 派发，
//! 新增协议只需增加变体和对应的实现。

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{Issues, ProfileId, TransportSettings};
use crate::common::codec::{
    base64_encode, base64_url_encode, build_query, format_host_port, percent_encode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    Socks,
    Http,
    Shadowsocks,
    Vmess,
    Vless,
    Trojan,
    Hysteria,
    Hysteria2,
    Tuic,
    Naive,
    Custom,
    Chain,
}

impl ProtocolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolKind::Socks => "socks",
            ProtocolKind::Http => "http",
            ProtocolKind::Shadowsocks => "shadowsocks",
            ProtocolKind::Vmess => "vmess",
            ProtocolKind::Vless => "vless",
            ProtocolKind::Trojan => "trojan",
            ProtocolKind::Hysteria => "hysteria",
            ProtocolKind::Hysteria2 => "hysteria2",
            ProtocolKind::Tuic => "tuic",
            ProtocolKind::Naive => "naive",
            ProtocolKind::Custom => "custom",
            ProtocolKind::Chain => "chain",
        }
    }
}

/// 需要外部辅助程序的协议（如 naive）给出的启动参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalInvocation {
    /// `extra_cores` 中的程序名
    pub helper: &'static str,
    pub args: Vec<String>,
}

/// 协议能力集合
pub trait ProtocolBean {
    fn kind(&self) -> ProtocolKind;

    /// 远端服务器地址，chain / custom 没有
    fn server(&self) -> Option<(&str, u16)>;

    /// 收集所有缺失/非法字段
    fn validate(&self, issues: &mut Issues);

    /// 规范化连接参数（不含显示名）
    fn identity_params(&self) -> Vec<String>;

    /// 不含 tag / detour 的 outbound 片段
    fn to_outbound(&self) -> Map<String, Value>;

    fn to_share_link(&self, name: &str) -> Option<String>;

    /// 需要的外部辅助程序名（`extra_cores` 的 key）
    fn helper(&self) -> Option<&'static str> {
        None
    }

    /// outbound 可以挂 `multiplex`
    fn supports_mux(&self) -> bool {
        false
    }

    /// `socks_port` 为辅助程序本地监听端口；`upstream` 为经 mapping 入站转发时的本地端口
    fn external(&self, _socks_port: u16, _upstream: Option<u16>) -> Option<ExternalInvocation> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum ProxyBean {
    Socks(SocksBean),
    Shadowsocks(ShadowsocksBean),
    Vmess(VmessBean),
    Vless(VlessBean),
    Trojan(TrojanBean),
    Quic(QuicBean),
    Naive(NaiveBean),
    Custom(CustomBean),
    Chain(ChainBean),
}

impl ProxyBean {
    pub fn protocol(&self) -> &dyn ProtocolBean {
        match self {
            ProxyBean::Socks(b) => b,
            ProxyBean::Shadowsocks(b) => b,
            ProxyBean::Vmess(b) => b,
            ProxyBean::Vless(b) => b,
            ProxyBean::Trojan(b) => b,
            ProxyBean::Quic(b) => b,
            ProxyBean::Naive(b) => b,
            ProxyBean::Custom(b) => b,
            ProxyBean::Chain(b) => b,
        }
    }

    pub fn chain_members(&self) -> Option<&[ProfileId]> {
        match self {
            ProxyBean::Chain(c) => Some(&c.members),
            _ => None,
        }
    }

    /// 完整自定义配置：JSON 直接作为整个 core 文档
    pub fn full_document(&self) -> Option<&Value> {
        match self {
            ProxyBean::Custom(c) if c.mode == CustomMode::Full => Some(&c.config),
            _ => None,
        }
    }
}

fn base_outbound(kind: &str, server: &str, port: u16) -> Map<String, Value> {
    let mut ob = Map::new();
    ob.insert("type".into(), json!(kind));
    ob.insert("server".into(), json!(server));
    ob.insert("server_port".into(), json!(port));
    ob
}

fn insert_nonempty(ob: &mut Map<String, Value>, key: &str, value: &str) {
    if !value.is_empty() {
        ob.insert(key.into(), json!(value));
    }
}

fn canonical_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn userinfo(username: &str, password: &str) -> String {
    match (username.is_empty(), password.is_empty()) {
        (true, true) => String::new(),
        (false, true) => format!("{}@", percent_encode(username)),
        _ => format!("{}:{}@", percent_encode(username), percent_encode(password)),
    }
}

fn with_fragment(mut link: String, name: &str) -> String {
    if !name.is_empty() {
        link.push('#');
        link.push_str(&percent_encode(name));
    }
    link
}

// ---------------------------------------------------------------------------
// SOCKS / HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocksVariant {
    Socks4,
    Socks4a,
    #[default]
    Socks5,
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SocksBean {
    pub variant: SocksVariant,
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// 仅 HTTP：https 代理
    pub tls: bool,
    pub sni: String,
    pub allow_insecure: bool,
}

impl ProtocolBean for SocksBean {
    fn kind(&self) -> ProtocolKind {
        match self.variant {
            SocksVariant::Http => ProtocolKind::Http,
            _ => ProtocolKind::Socks,
        }
    }

    fn server(&self) -> Option<(&str, u16)> {
        Some((&self.server, self.port))
    }

    fn validate(&self, issues: &mut Issues) {
        issues.require("server", &self.server);
        issues.require_port("port", self.port);
        if matches!(self.variant, SocksVariant::Socks4 | SocksVariant::Socks4a)
            && !self.password.is_empty()
        {
            issues.push("password", "socks4 has no password authentication");
        }
    }

    fn identity_params(&self) -> Vec<String> {
        vec![
            format!("{:?}", self.variant).to_ascii_lowercase(),
            canonical_host(&self.server),
            self.port.to_string(),
            self.username.clone(),
            self.password.clone(),
            self.tls.to_string(),
        ]
    }

    fn to_outbound(&self) -> Map<String, Value> {
        let kind = if self.variant == SocksVariant::Http { "http" } else { "socks" };
        let mut ob = base_outbound(kind, &self.server, self.port);
        match self.variant {
            SocksVariant::Socks4 => {
                ob.insert("version".into(), json!("4"));
            }
            SocksVariant::Socks4a => {
                ob.insert("version".into(), json!("4a"));
            }
            SocksVariant::Socks5 => {
                ob.insert("version".into(), json!("5"));
            }
            SocksVariant::Http => {}
        }
        insert_nonempty(&mut ob, "username", &self.username);
        insert_nonempty(&mut ob, "password", &self.password);
        if self.variant == SocksVariant::Http && self.tls {
            let transport = TransportSettings {
                security: "tls".into(),
                sni: self.sni.clone(),
                allow_insecure: self.allow_insecure,
                ..Default::default()
            };
            ob.insert("tls".into(), transport.tls_json(&self.server));
        }
        ob
    }

    fn to_share_link(&self, name: &str) -> Option<String> {
        let scheme = match self.variant {
            SocksVariant::Socks4 => "socks4",
            SocksVariant::Socks4a => "socks4a",
            SocksVariant::Socks5 => "socks5",
            SocksVariant::Http if self.tls => "https",
            SocksVariant::Http => "http",
        };
        let link = format!(
            "{scheme}://{}{}",
            userinfo(&self.username, &self.password),
            format_host_port(&self.server, self.port)
        );
        Some(with_fragment(link, name))
    }
}

// ---------------------------------------------------------------------------
// Shadowsocks
// ---------------------------------------------------------------------------

const SS_METHODS: &[&str] = &[
    "aes-128-gcm",
    "aes-192-gcm",
    "aes-256-gcm",
    "chacha20-ietf-poly1305",
    "xchacha20-ietf-poly1305",
    "2022-blake3-aes-128-gcm",
    "2022-blake3-aes-256-gcm",
    "2022-blake3-chacha20-poly1305",
    "none",
];

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowsocksBean {
    pub server: String,
    pub port: u16,
    pub method: String,
    pub password: String,
    pub plugin: String,
    pub plugin_opts: String,
    pub udp_over_tcp: bool,
}

impl ProtocolBean for ShadowsocksBean {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Shadowsocks
    }

    fn supports_mux(&self) -> bool {
        true
    }

    fn server(&self) -> Option<(&str, u16)> {
        Some((&self.server, self.port))
    }

    fn validate(&self, issues: &mut Issues) {
        issues.require("server", &self.server);
        issues.require_port("port", self.port);
        if self.method.is_empty() {
            issues.push("method", "required");
        } else if !SS_METHODS.contains(&self.method.as_str()) {
            issues.push("method", format!("unsupported cipher '{}'", self.method));
        }
        if self.method != "none" {
            issues.require("password", &self.password);
        }
    }

    fn identity_params(&self) -> Vec<String> {
        vec![
            canonical_host(&self.server),
            self.port.to_string(),
            self.method.to_ascii_lowercase(),
            self.password.clone(),
            self.plugin.clone(),
        ]
    }

    fn to_outbound(&self) -> Map<String, Value> {
        let mut ob = base_outbound("shadowsocks", &self.server, self.port);
        ob.insert("method".into(), json!(self.method));
        ob.insert("password".into(), json!(self.password));
        insert_nonempty(&mut ob, "plugin", &self.plugin);
        insert_nonempty(&mut ob, "plugin_opts", &self.plugin_opts);
        if self.udp_over_tcp {
            ob.insert("udp_over_tcp".into(), json!(true));
        }
        ob
    }

    fn to_share_link(&self, name: &str) -> Option<String> {
        let user = base64_url_encode(&format!("{}:{}", self.method, self.password));
        let mut link = format!("ss://{user}@{}", format_host_port(&self.server, self.port));
        if !self.plugin.is_empty() {
            let plugin = if self.plugin_opts.is_empty() {
                self.plugin.clone()
            } else {
                format!("{};{}", self.plugin, self.plugin_opts)
            };
            link.push_str("?plugin=");
            link.push_str(&percent_encode(&plugin));
        }
        Some(with_fragment(link, name))
    }
}

// ---------------------------------------------------------------------------
// VMess
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VmessBean {
    pub server: String,
    pub port: u16,
    pub uuid: String,
    pub alter_id: u32,
    /// auto / aes-128-gcm / chacha20-poly1305 / none / zero
    pub security: String,
    pub transport: TransportSettings,
}

impl ProtocolBean for VmessBean {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Vmess
    }

    fn supports_mux(&self) -> bool {
        !self.transport.carries_mux()
    }

    fn server(&self) -> Option<(&str, u16)> {
        Some((&self.server, self.port))
    }

    fn validate(&self, issues: &mut Issues) {
        issues.require("server", &self.server);
        issues.require_port("port", self.port);
        if self.uuid.is_empty() {
            issues.push("uuid", "required");
        } else if uuid::Uuid::parse_str(&self.uuid).is_err() {
            issues.push("uuid", "not a valid UUID");
        }
        self.transport.validate(issues);
    }

    fn identity_params(&self) -> Vec<String> {
        let mut p = vec![
            canonical_host(&self.server),
            self.port.to_string(),
            self.uuid.to_ascii_lowercase(),
        ];
        p.extend(self.transport.identity_params());
        p
    }

    fn to_outbound(&self) -> Map<String, Value> {
        let mut ob = base_outbound("vmess", &self.server, self.port);
        ob.insert("uuid".into(), json!(self.uuid));
        ob.insert("alter_id".into(), json!(self.alter_id));
        let security = if self.security.is_empty() { "auto" } else { &self.security };
        ob.insert("security".into(), json!(security));
        self.transport.apply(&mut ob, &self.server);
        ob
    }

    fn to_share_link(&self, name: &str) -> Option<String> {
        // v2rayN 格式
        let t = &self.transport;
        let doc = json!({
            "v": "2",
            "ps": name,
            "add": self.server,
            "port": self.port.to_string(),
            "id": self.uuid,
            "aid": self.alter_id.to_string(),
            "scy": if self.security.is_empty() { "auto" } else { self.security.as_str() },
            "net": t.network(),
            "type": "none",
            "host": t.host,
            "path": if t.network() == "grpc" { &t.service_name } else { &t.path },
            "tls": if t.tls_enabled() { "tls" } else { "" },
            "sni": t.sni,
            "alpn": t.alpn.join(","),
            "fp": t.fingerprint,
        });
        Some(format!("vmess://{}", base64_encode(&doc.to_string())))
    }
}

// ---------------------------------------------------------------------------
// VLESS / Trojan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VlessBean {
    pub server: String,
    pub port: u16,
    pub uuid: String,
    pub flow: String,
    pub packet_encoding: String,
    pub transport: TransportSettings,
}

impl ProtocolBean for VlessBean {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Vless
    }

    fn supports_mux(&self) -> bool {
        // flow（如 xtls-rprx-vision）与 mux 不兼容
        self.flow.is_empty() && !self.transport.carries_mux()
    }

    fn server(&self) -> Option<(&str, u16)> {
        Some((&self.server, self.port))
    }

    fn validate(&self, issues: &mut Issues) {
        issues.require("server", &self.server);
        issues.require_port("port", self.port);
        if self.uuid.is_empty() {
            issues.push("uuid", "required");
        } else if uuid::Uuid::parse_str(&self.uuid).is_err() {
            issues.push("uuid", "not a valid UUID");
        }
        if !self.flow.is_empty() && !self.flow.starts_with("xtls-rprx-vision") {
            issues.push("flow", format!("unsupported flow '{}'", self.flow));
        }
        self.transport.validate(issues);
    }

    fn identity_params(&self) -> Vec<String> {
        let mut p = vec![
            canonical_host(&self.server),
            self.port.to_string(),
            self.uuid.to_ascii_lowercase(),
            self.flow.clone(),
        ];
        p.extend(self.transport.identity_params());
        p
    }

    fn to_outbound(&self) -> Map<String, Value> {
        let mut ob = base_outbound("vless", &self.server, self.port);
        ob.insert("uuid".into(), json!(self.uuid));
        insert_nonempty(&mut ob, "flow", &self.flow);
        insert_nonempty(&mut ob, "packet_encoding", &self.packet_encoding);
        self.transport.apply(&mut ob, &self.server);
        ob
    }

    fn to_share_link(&self, name: &str) -> Option<String> {
        let mut query = Vec::new();
        self.transport.to_query(&mut query);
        query.push(("flow".into(), self.flow.clone()));
        query.push(("packetEncoding".into(), self.packet_encoding.clone()));
        let link = format!(
            "vless://{}@{}?{}",
            percent_encode(&self.uuid),
            format_host_port(&self.server, self.port),
            build_query(&query)
        );
        Some(with_fragment(link, name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrojanBean {
    pub server: String,
    pub port: u16,
    pub password: String,
    pub transport: TransportSettings,
}

impl ProtocolBean for TrojanBean {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Trojan
    }

    fn supports_mux(&self) -> bool {
        !self.transport.carries_mux()
    }

    fn server(&self) -> Option<(&str, u16)> {
        Some((&self.server, self.port))
    }

    fn validate(&self, issues: &mut Issues) {
        issues.require("server", &self.server);
        issues.require_port("port", self.port);
        issues.require("password", &self.password);
        self.transport.validate(issues);
    }

    fn identity_params(&self) -> Vec<String> {
        let mut p = vec![
            canonical_host(&self.server),
            self.port.to_string(),
            self.password.clone(),
        ];
        p.extend(self.transport.identity_params());
        p
    }

    fn to_outbound(&self) -> Map<String, Value> {
        let mut ob = base_outbound("trojan", &self.server, self.port);
        ob.insert("password".into(), json!(self.password));
        self.transport.apply(&mut ob, &self.server);
        ob
    }

    fn to_share_link(&self, name: &str) -> Option<String> {
        let mut query = Vec::new();
        self.transport.to_query(&mut query);
        let link = format!(
            "trojan://{}@{}?{}",
            percent_encode(&self.password),
            format_host_port(&self.server, self.port),
            build_query(&query)
        );
        Some(with_fragment(link, name))
    }
}

// ---------------------------------------------------------------------------
// Hysteria / Hysteria2 / TUIC
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuicVariant {
    Hysteria,
    #[default]
    Hysteria2,
    Tuic,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuicBean {
    pub variant: QuicVariant,
    pub server: String,
    pub port: u16,
    /// hysteria: auth_str；hysteria2 / tuic: password
    pub password: String,
    /// 仅 tuic
    pub uuid: String,
    pub obfs_password: String,
    pub up_mbps: u32,
    pub down_mbps: u32,
    pub congestion_control: String,
    pub udp_relay_mode: String,
    pub sni: String,
    pub alpn: Vec<String>,
    pub allow_insecure: bool,
}

impl QuicBean {
    fn tls(&self) -> Value {
        let transport = TransportSettings {
            security: "tls".into(),
            sni: self.sni.clone(),
            alpn: self.alpn.clone(),
            allow_insecure: self.allow_insecure,
            ..Default::default()
        };
        transport.tls_json(&self.server)
    }
}

impl ProtocolBean for QuicBean {
    fn kind(&self) -> ProtocolKind {
        match self.variant {
            QuicVariant::Hysteria => ProtocolKind::Hysteria,
            QuicVariant::Hysteria2 => ProtocolKind::Hysteria2,
            QuicVariant::Tuic => ProtocolKind::Tuic,
        }
    }

    fn server(&self) -> Option<(&str, u16)> {
        Some((&self.server, self.port))
    }

    fn validate(&self, issues: &mut Issues) {
        issues.require("server", &self.server);
        issues.require_port("port", self.port);
        match self.variant {
            QuicVariant::Hysteria => {
                if self.up_mbps == 0 {
                    issues.push("up_mbps", "required for hysteria");
                }
                if self.down_mbps == 0 {
                    issues.push("down_mbps", "required for hysteria");
                }
            }
            QuicVariant::Hysteria2 => issues.require("password", &self.password),
            QuicVariant::Tuic => {
                if uuid::Uuid::parse_str(&self.uuid).is_err() {
                    issues.push("uuid", "not a valid UUID");
                }
            }
        }
    }

    fn identity_params(&self) -> Vec<String> {
        vec![
            canonical_host(&self.server),
            self.port.to_string(),
            self.uuid.to_ascii_lowercase(),
            self.password.clone(),
            self.obfs_password.clone(),
            self.sni.to_ascii_lowercase(),
        ]
    }

    fn to_outbound(&self) -> Map<String, Value> {
        let mut ob;
        match self.variant {
            QuicVariant::Hysteria => {
                ob = base_outbound("hysteria", &self.server, self.port);
                ob.insert("up_mbps".into(), json!(self.up_mbps));
                ob.insert("down_mbps".into(), json!(self.down_mbps));
                insert_nonempty(&mut ob, "auth_str", &self.password);
                insert_nonempty(&mut ob, "obfs", &self.obfs_password);
            }
            QuicVariant::Hysteria2 => {
                ob = base_outbound("hysteria2", &self.server, self.port);
                ob.insert("password".into(), json!(self.password));
                if self.up_mbps > 0 {
                    ob.insert("up_mbps".into(), json!(self.up_mbps));
                }
                if self.down_mbps > 0 {
                    ob.insert("down_mbps".into(), json!(self.down_mbps));
                }
                if !self.obfs_password.is_empty() {
                    ob.insert(
                        "obfs".into(),
                        json!({ "type": "salamander", "password": self.obfs_password }),
                    );
                }
            }
            QuicVariant::Tuic => {
                ob = base_outbound("tuic", &self.server, self.port);
                ob.insert("uuid".into(), json!(self.uuid));
                insert_nonempty(&mut ob, "password", &self.password);
                insert_nonempty(&mut ob, "congestion_control", &self.congestion_control);
                insert_nonempty(&mut ob, "udp_relay_mode", &self.udp_relay_mode);
            }
        }
        ob.insert("tls".into(), self.tls());
        ob
    }

    fn to_share_link(&self, name: &str) -> Option<String> {
        let host = format_host_port(&self.server, self.port);
        let mut query: Vec<(String, String)> = Vec::new();
        query.push(("sni".into(), self.sni.clone()));
        if self.allow_insecure {
            query.push(("insecure".into(), "1".into()));
        }
        let link = match self.variant {
            QuicVariant::Hysteria => {
                query.push(("auth".into(), self.password.clone()));
                query.push(("upmbps".into(), self.up_mbps.to_string()));
                query.push(("downmbps".into(), self.down_mbps.to_string()));
                query.push(("obfsParam".into(), self.obfs_password.clone()));
                query.push(("alpn".into(), self.alpn.join(",")));
                format!("hysteria://{host}?{}", build_query(&query))
            }
            QuicVariant::Hysteria2 => {
                if !self.obfs_password.is_empty() {
                    query.push(("obfs".into(), "salamander".into()));
                    query.push(("obfs-password".into(), self.obfs_password.clone()));
                }
                format!(
                    "hy2://{}@{host}?{}",
                    percent_encode(&self.password),
                    build_query(&query)
                )
            }
            QuicVariant::Tuic => {
                query.push(("congestion_control".into(), self.congestion_control.clone()));
                query.push(("udp_relay_mode".into(), self.udp_relay_mode.clone()));
                query.push(("alpn".into(), self.alpn.join(",")));
                format!(
                    "tuic://{}@{host}?{}",
                    userinfo(&self.uuid, &self.password).trim_end_matches('@'),
                    build_query(&query)
                )
            }
        };
        Some(with_fragment(link, name))
    }
}

// ---------------------------------------------------------------------------
// NaiveProxy（外部辅助程序）
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NaiveBean {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// https / quic
    pub protocol: String,
    pub sni: String,
    pub concurrency: u32,
}

impl NaiveBean {
    fn scheme(&self) -> &str {
        if self.protocol == "quic" {
            "quic"
        } else {
            "https"
        }
    }
}

impl ProtocolBean for NaiveBean {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Naive
    }

    fn server(&self) -> Option<(&str, u16)> {
        Some((&self.server, self.port))
    }

    fn validate(&self, issues: &mut Issues) {
        issues.require("server", &self.server);
        issues.require_port("port", self.port);
        if !matches!(self.protocol.as_str(), "" | "https" | "quic") {
            issues.push("protocol", format!("unsupported protocol '{}'", self.protocol));
        }
    }

    fn identity_params(&self) -> Vec<String> {
        vec![
            canonical_host(&self.server),
            self.port.to_string(),
            self.username.clone(),
            self.password.clone(),
            self.scheme().to_string(),
        ]
    }

    /// 真正的出站由辅助程序提供，core 只看到本地 socks
    fn to_outbound(&self) -> Map<String, Value> {
        let mut ob = Map::new();
        ob.insert("type".into(), json!("socks"));
        ob.insert("version".into(), json!("5"));
        ob
    }

    fn to_share_link(&self, name: &str) -> Option<String> {
        let link = format!(
            "naive+{}://{}{}",
            self.scheme(),
            userinfo(&self.username, &self.password),
            format_host_port(&self.server, self.port)
        );
        Some(with_fragment(link, name))
    }

    fn helper(&self) -> Option<&'static str> {
        Some("naive")
    }

    fn external(&self, socks_port: u16, upstream: Option<u16>) -> Option<ExternalInvocation> {
        let sni = if self.sni.is_empty() { &self.server } else { &self.sni };
        let mut args = vec![format!("--listen=socks://127.0.0.1:{socks_port}")];
        let target = match upstream {
            // 经 mapping 入站转发：连接本地端口，证书仍按原主机名校验
            Some(local) => {
                args.push(format!("--host-resolver-rules=MAP {sni} 127.0.0.1"));
                format!("{sni}:{local}")
            }
            None => format_host_port(sni, self.port),
        };
        args.push(format!(
            "--proxy={}://{}{}",
            self.scheme(),
            userinfo(&self.username, &self.password),
            target
        ));
        if upstream.is_none() && !self.sni.is_empty() && self.sni != self.server {
            args.push(format!("--host-resolver-rules=MAP {} {}", self.sni, self.server));
        }
        if self.concurrency > 0 {
            args.push(format!("--insecure-concurrency={}", self.concurrency));
        }
        Some(ExternalInvocation {
            helper: "naive",
            args,
        })
    }
}

// ---------------------------------------------------------------------------
// 自定义 JSON / 链式
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomMode {
    #[default]
    Outbound,
    Full,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomBean {
    pub mode: CustomMode,
    pub config: Value,
}

impl ProtocolBean for CustomBean {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Custom
    }

    fn server(&self) -> Option<(&str, u16)> {
        let server = self.config.get("server")?.as_str()?;
        let port = self.config.get("server_port")?.as_u64()?;
        Some((server, u16::try_from(port).ok()?))
    }

    fn validate(&self, issues: &mut Issues) {
        let Some(obj) = self.config.as_object() else {
            issues.push("config", "must be a JSON object");
            return;
        };
        match self.mode {
            CustomMode::Outbound => {
                if !obj.get("type").map_or(false, Value::is_string) {
                    issues.push("config.type", "outbound type required");
                }
            }
            CustomMode::Full => {
                if !obj.get("outbounds").map_or(false, Value::is_array) {
                    issues.push("config.outbounds", "full document needs an outbounds array");
                }
            }
        }
    }

    fn identity_params(&self) -> Vec<String> {
        // serde_json 默认按 key 排序，序列化结果稳定
        vec![format!("{:?}", self.mode), self.config.to_string()]
    }

    fn to_outbound(&self) -> Map<String, Value> {
        let mut ob = self.config.as_object().cloned().unwrap_or_default();
        ob.remove("tag");
        ob.remove("detour");
        ob
    }

    fn to_share_link(&self, _name: &str) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainBean {
    /// 按连接顺序：第一个直连，最后一个连接目标
    pub members: Vec<ProfileId>,
}

impl ProtocolBean for ChainBean {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Chain
    }

    fn server(&self) -> Option<(&str, u16)> {
        None
    }

    fn validate(&self, issues: &mut Issues) {
        if self.members.is_empty() {
            issues.push("members", "chain needs at least one member");
        }
    }

    fn identity_params(&self) -> Vec<String> {
        self.members.iter().map(ToString::to_string).collect()
    }

    fn to_outbound(&self) -> Map<String, Value> {
        Map::new()
    }

    fn to_share_link(&self, _name: &str) -> Option<String> {
        None
    }
}
