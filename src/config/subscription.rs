//! 订阅内容解析
//!
//! 格式检测顺序：结构化文档（sing-box JSON / SIP008 / Clash YAML）优先，
//! 然后是 base64 包裹的链接列表，最后按明文链接列表处理。
//! 单条解析失败只计入 `skipped`，不影响整体。

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::link::parse_share_link;
use crate::common::codec::{base64_decode, is_base64};
use crate::model::bean::{
    QuicBean, QuicVariant, ShadowsocksBean, SocksBean, SocksVariant, TrojanBean, VlessBean,
    VmessBean,
};
use crate::model::{IdentityKey, ProxyBean, TransportSettings};

/// 从订阅中解析出的一个节点
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub name: String,
    pub bean: ProxyBean,
}

impl Candidate {
    pub fn new(name: impl Into<String>, bean: ProxyBean) -> Self {
        Self {
            name: name.into(),
            bean,
        }
    }

    pub fn identity(&self) -> IdentityKey {
        IdentityKey::of(&self.bean)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubFormat {
    SingBoxJson,
    Sip008,
    ClashYaml,
    Base64,
    LinkList,
}

impl SubFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            SubFormat::SingBoxJson => "sing-box",
            SubFormat::Sip008 => "sip008",
            SubFormat::ClashYaml => "clash",
            SubFormat::Base64 => "base64",
            SubFormat::LinkList => "links",
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("subscription document is empty")]
    Empty,

    #[error("malformed {format} document: {reason}")]
    Malformed { format: &'static str, reason: String },

    #[error("no usable entries in {format} document ({skipped} skipped)")]
    NoEntries { format: &'static str, skipped: usize },
}

#[derive(Debug)]
pub struct ParsedSubscription {
    pub format: SubFormat,
    /// 已按身份去重，保留首次出现
    pub candidates: Vec<Candidate>,
    pub skipped: usize,
    pub duplicates: usize,
}

/// Detect the format of subscription content
pub fn detect_format(content: &str) -> SubFormat {
    let trimmed = content.trim();

    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
            if v.get("servers").is_some() {
                return SubFormat::Sip008;
            }
            return SubFormat::SingBoxJson;
        }
    }

    if trimmed.contains("proxies:") {
        if let Ok(v) = serde_yml::from_str::<Value>(trimmed) {
            if v.get("proxies").map_or(false, Value::is_array) {
                return SubFormat::ClashYaml;
            }
        }
    }

    if !trimmed.contains("://") && is_base64(trimmed) {
        if let Some(decoded) = base64_decode(trimmed) {
            if decoded.contains("://") {
                return SubFormat::Base64;
            }
        }
    }

    SubFormat::LinkList
}

/// 根据格式自动解析订阅内容
pub fn parse_subscription(content: &str) -> Result<ParsedSubscription, ParseError> {
    if content.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    let format = detect_format(content);
    let mut entries = Entries::default();
    match format {
        SubFormat::SingBoxJson => parse_singbox_json(content, &mut entries)?,
        SubFormat::Sip008 => parse_sip008(content, &mut entries)?,
        SubFormat::ClashYaml => parse_clash_yaml(content, &mut entries)?,
        SubFormat::Base64 => {
            let decoded = base64_decode(content.trim()).ok_or_else(|| ParseError::Malformed {
                format: format.as_str(),
                reason: "invalid base64".into(),
            })?;
            parse_link_list(&decoded, &mut entries);
        }
        SubFormat::LinkList => parse_link_list(content, &mut entries),
    }

    if entries.candidates.is_empty() && entries.skipped > 0 {
        return Err(ParseError::NoEntries {
            format: format.as_str(),
            skipped: entries.skipped,
        });
    }
    let (candidates, duplicates) = dedup_candidates(entries.candidates);
    tracing::debug!(
        format = format.as_str(),
        candidates = candidates.len(),
        skipped = entries.skipped,
        duplicates,
        "subscription parsed"
    );
    Ok(ParsedSubscription {
        format,
        candidates,
        skipped: entries.skipped,
        duplicates,
    })
}

#[derive(Default)]
struct Entries {
    candidates: Vec<Candidate>,
    skipped: usize,
}

impl Entries {
    fn push(&mut self, result: Result<Option<Candidate>, String>) {
        match result {
            Ok(Some(c)) => self.candidates.push(c),
            Ok(None) => {}
            Err(reason) => {
                tracing::debug!(reason = reason.as_str(), "subscription entry skipped");
                self.skipped += 1;
            }
        }
    }
}

/// 同一身份只保留第一个
pub fn dedup_candidates(candidates: Vec<Candidate>) -> (Vec<Candidate>, usize) {
    let mut seen = HashSet::new();
    let before = candidates.len();
    let kept: Vec<_> = candidates
        .into_iter()
        .filter(|c| seen.insert(c.identity()))
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

fn parse_link_list(content: &str, entries: &mut Entries) {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }
        entries.push(parse_share_link(line).map(Some).map_err(|e| e.to_string()));
    }
}

// ---------------------------------------------------------------------------
// sing-box JSON
// ---------------------------------------------------------------------------

fn parse_singbox_json(content: &str, entries: &mut Entries) -> Result<(), ParseError> {
    let root: Value = serde_json::from_str(content.trim()).map_err(|e| ParseError::Malformed {
        format: SubFormat::SingBoxJson.as_str(),
        reason: e.to_string(),
    })?;
    let outbounds = match &root {
        Value::Array(items) => items.as_slice(),
        Value::Object(obj) => obj
            .get("outbounds")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .ok_or_else(|| ParseError::Malformed {
                format: SubFormat::SingBoxJson.as_str(),
                reason: "missing outbounds array".into(),
            })?,
        _ => {
            return Err(ParseError::Malformed {
                format: SubFormat::SingBoxJson.as_str(),
                reason: "expected an object or array".into(),
            })
        }
    };
    for ob in outbounds {
        entries.push(singbox_outbound(ob));
    }
    Ok(())
}

fn str_field(v: &Value, key: &str) -> String {
    match v.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn port_field(v: &Value, key: &str) -> Result<u16, String> {
    let port = match v.get(key) {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    };
    port.and_then(|p| u16::try_from(p).ok())
        .filter(|p| *p != 0)
        .ok_or_else(|| format!("missing or invalid {key}"))
}

fn string_list(v: Option<&Value>) -> Vec<String> {
    match v {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|x| !x.is_empty())
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

fn singbox_transport(ob: &Value) -> TransportSettings {
    let mut t = TransportSettings::default();
    if let Some(tr) = ob.get("transport") {
        t.network = str_field(tr, "type");
        t.path = str_field(tr, "path");
        t.service_name = str_field(tr, "service_name");
        t.host = match tr.get("headers").and_then(|h| h.get("Host")) {
            Some(h) => h.as_str().unwrap_or_default().to_string(),
            None => string_list(tr.get("host")).join(","),
        };
    }
    if let Some(tls) = ob.get("tls") {
        if tls.get("enabled").and_then(Value::as_bool).unwrap_or(false) {
            t.security = "tls".into();
        }
        t.sni = str_field(tls, "server_name");
        t.allow_insecure = tls.get("insecure").and_then(Value::as_bool).unwrap_or(false);
        t.alpn = string_list(tls.get("alpn"));
        if let Some(utls) = tls.get("utls") {
            t.fingerprint = str_field(utls, "fingerprint");
        }
        if let Some(reality) = tls.get("reality") {
            if reality.get("enabled").and_then(Value::as_bool).unwrap_or(false) {
                t.security = "reality".into();
                t.reality_public_key = str_field(reality, "public_key");
                t.reality_short_id = str_field(reality, "short_id");
            }
        }
    }
    t
}

fn singbox_outbound(ob: &Value) -> Result<Option<Candidate>, String> {
    let kind = str_field(ob, "type");
    if matches!(
        kind.as_str(),
        "direct" | "block" | "dns" | "selector" | "urltest"
    ) {
        return Ok(None);
    }
    let server = str_field(ob, "server");
    if server.is_empty() {
        return Err(format!("{kind} outbound without server"));
    }
    let port = port_field(ob, "server_port")?;
    let transport = singbox_transport(ob);
    let bean = match kind.as_str() {
        "socks" | "http" => ProxyBean::Socks(SocksBean {
            variant: match (kind.as_str(), str_field(ob, "version").as_str()) {
                ("http", _) => SocksVariant::Http,
                (_, "4") => SocksVariant::Socks4,
                (_, "4a") => SocksVariant::Socks4a,
                _ => SocksVariant::Socks5,
            },
            server,
            port,
            username: str_field(ob, "username"),
            password: str_field(ob, "password"),
            tls: transport.tls_enabled(),
            sni: transport.sni.clone(),
            allow_insecure: transport.allow_insecure,
        }),
        "shadowsocks" => ProxyBean::Shadowsocks(ShadowsocksBean {
            server,
            port,
            method: str_field(ob, "method"),
            password: str_field(ob, "password"),
            plugin: str_field(ob, "plugin"),
            plugin_opts: str_field(ob, "plugin_opts"),
            udp_over_tcp: ob.get("udp_over_tcp").and_then(Value::as_bool).unwrap_or(false),
        }),
        "vmess" => ProxyBean::Vmess(VmessBean {
            server,
            port,
            uuid: str_field(ob, "uuid"),
            alter_id: str_field(ob, "alter_id").parse().unwrap_or(0),
            security: str_field(ob, "security"),
            transport,
        }),
        "vless" => ProxyBean::Vless(VlessBean {
            server,
            port,
            uuid: str_field(ob, "uuid"),
            flow: str_field(ob, "flow"),
            packet_encoding: str_field(ob, "packet_encoding"),
            transport,
        }),
        "trojan" => ProxyBean::Trojan(TrojanBean {
            server,
            port,
            password: str_field(ob, "password"),
            transport,
        }),
        "hysteria" | "hysteria2" | "tuic" => {
            let variant = match kind.as_str() {
                "hysteria" => QuicVariant::Hysteria,
                "tuic" => QuicVariant::Tuic,
                _ => QuicVariant::Hysteria2,
            };
            let obfs_password = match ob.get("obfs") {
                Some(Value::String(s)) => s.clone(),
                Some(obj @ Value::Object(_)) => str_field(obj, "password"),
                _ => String::new(),
            };
            let password = match variant {
                QuicVariant::Hysteria => str_field(ob, "auth_str"),
                _ => str_field(ob, "password"),
            };
            ProxyBean::Quic(QuicBean {
                variant,
                server,
                port,
                password,
                uuid: str_field(ob, "uuid"),
                obfs_password,
                up_mbps: str_field(ob, "up_mbps").parse().unwrap_or(0),
                down_mbps: str_field(ob, "down_mbps").parse().unwrap_or(0),
                congestion_control: str_field(ob, "congestion_control"),
                udp_relay_mode: str_field(ob, "udp_relay_mode"),
                sni: transport.sni.clone(),
                alpn: transport.alpn.clone(),
                allow_insecure: transport.allow_insecure,
            })
        }
        other => return Err(format!("unsupported outbound type '{other}'")),
    };
    let name = match str_field(ob, "tag") {
        t if t.is_empty() => format!("{kind}-{}", str_field(ob, "server")),
        t => t,
    };
    Ok(Some(Candidate::new(name, bean)))
}

// ---------------------------------------------------------------------------
// SIP008
// ---------------------------------------------------------------------------

/// Format: {"version": 1, "servers": [{"server": "...", "server_port": 8388, ...}]}
fn parse_sip008(content: &str, entries: &mut Entries) -> Result<(), ParseError> {
    #[derive(Deserialize)]
    struct Sip008Config {
        #[serde(default)]
        servers: Vec<Value>,
    }

    let config: Sip008Config =
        serde_json::from_str(content.trim()).map_err(|e| ParseError::Malformed {
            format: SubFormat::Sip008.as_str(),
            reason: e.to_string(),
        })?;
    for (idx, srv) in config.servers.iter().enumerate() {
        entries.push(sip008_server(idx, srv));
    }
    Ok(())
}

fn sip008_server(idx: usize, srv: &Value) -> Result<Option<Candidate>, String> {
    let server = str_field(srv, "server");
    if server.is_empty() {
        return Err("sip008 server without address".into());
    }
    let port = port_field(srv, "server_port")?;
    let name = [str_field(srv, "remarks"), str_field(srv, "id")]
        .into_iter()
        .find(|s| !s.is_empty())
        .unwrap_or_else(|| format!("ss-{idx}"));
    let bean = ShadowsocksBean {
        server,
        port,
        method: str_field(srv, "method"),
        password: str_field(srv, "password"),
        plugin: str_field(srv, "plugin"),
        plugin_opts: str_field(srv, "plugin_opts"),
        udp_over_tcp: false,
    };
    Ok(Some(Candidate::new(name, ProxyBean::Shadowsocks(bean))))
}

// ---------------------------------------------------------------------------
// Clash YAML
// ---------------------------------------------------------------------------

fn parse_clash_yaml(content: &str, entries: &mut Entries) -> Result<(), ParseError> {
    let root: Value = serde_yml::from_str(content).map_err(|e| ParseError::Malformed {
        format: SubFormat::ClashYaml.as_str(),
        reason: e.to_string(),
    })?;
    let proxies = root
        .get("proxies")
        .and_then(Value::as_array)
        .ok_or_else(|| ParseError::Malformed {
            format: SubFormat::ClashYaml.as_str(),
            reason: "missing proxies list".into(),
        })?;
    for proxy in proxies {
        entries.push(clash_proxy(proxy));
    }
    Ok(())
}

fn bool_field(v: &Value, key: &str) -> bool {
    match v.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s == "true" || s == "1",
        _ => false,
    }
}

fn clash_transport(p: &Value) -> TransportSettings {
    let mut t = TransportSettings {
        network: str_field(p, "network"),
        sni: [str_field(p, "servername"), str_field(p, "sni")]
            .into_iter()
            .find(|s| !s.is_empty())
            .unwrap_or_default(),
        allow_insecure: bool_field(p, "skip-cert-verify"),
        alpn: string_list(p.get("alpn")),
        fingerprint: str_field(p, "client-fingerprint"),
        ..Default::default()
    };
    if bool_field(p, "tls") {
        t.security = "tls".into();
    }
    if let Some(ws) = p.get("ws-opts") {
        t.path = str_field(ws, "path");
        if let Some(host) = ws.get("headers").and_then(|h| h.get("Host")) {
            t.host = host.as_str().unwrap_or_default().to_string();
        }
    }
    if let Some(h2) = p.get("h2-opts") {
        t.network = "http".into();
        t.path = str_field(h2, "path");
        t.host = string_list(h2.get("host")).join(",");
    }
    if let Some(grpc) = p.get("grpc-opts") {
        t.service_name = str_field(grpc, "grpc-service-name");
    }
    if let Some(reality) = p.get("reality-opts") {
        t.security = "reality".into();
        t.reality_public_key = str_field(reality, "public-key");
        t.reality_short_id = str_field(reality, "short-id");
    }
    if t.network == "h2" {
        t.network = "http".into();
    }
    t
}

fn clash_proxy(p: &Value) -> Result<Option<Candidate>, String> {
    let kind = str_field(p, "type");
    let server = str_field(p, "server");
    if server.is_empty() {
        return Err(format!("{kind} proxy without server"));
    }
    let port = port_field(p, "port")?;
    let bean = match kind.as_str() {
        "ss" => ProxyBean::Shadowsocks(ShadowsocksBean {
            server,
            port,
            method: str_field(p, "cipher"),
            password: str_field(p, "password"),
            plugin: str_field(p, "plugin"),
            plugin_opts: String::new(),
            udp_over_tcp: bool_field(p, "udp-over-tcp"),
        }),
        "vmess" => ProxyBean::Vmess(VmessBean {
            server,
            port,
            uuid: str_field(p, "uuid"),
            alter_id: str_field(p, "alterId").parse().unwrap_or(0),
            security: str_field(p, "cipher"),
            transport: clash_transport(p),
        }),
        "vless" => ProxyBean::Vless(VlessBean {
            server,
            port,
            uuid: str_field(p, "uuid"),
            flow: str_field(p, "flow"),
            packet_encoding: str_field(p, "packet-encoding"),
            transport: clash_transport(p),
        }),
        "trojan" => {
            let mut transport = clash_transport(p);
            if transport.security.is_empty() {
                transport.security = "tls".into();
            }
            ProxyBean::Trojan(TrojanBean {
                server,
                port,
                password: str_field(p, "password"),
                transport,
            })
        }
        "socks5" | "http" => {
            let transport = clash_transport(p);
            ProxyBean::Socks(SocksBean {
                variant: if kind == "http" {
                    SocksVariant::Http
                } else {
                    SocksVariant::Socks5
                },
                server,
                port,
                username: str_field(p, "username"),
                password: str_field(p, "password"),
                tls: transport.tls_enabled(),
                sni: transport.sni,
                allow_insecure: transport.allow_insecure,
            })
        }
        "hysteria" | "hysteria2" | "tuic" => {
            let transport = clash_transport(p);
            let variant = match kind.as_str() {
                "hysteria" => QuicVariant::Hysteria,
                "tuic" => QuicVariant::Tuic,
                _ => QuicVariant::Hysteria2,
            };
            let password = match variant {
                QuicVariant::Hysteria => str_field(p, "auth-str"),
                _ => str_field(p, "password"),
            };
            let mbps = |key: &str| -> u32 {
                str_field(p, key)
                    .split_whitespace()
                    .next()
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(0)
            };
            ProxyBean::Quic(QuicBean {
                variant,
                server,
                port,
                password,
                uuid: str_field(p, "uuid"),
                obfs_password: match variant {
                    QuicVariant::Hysteria => str_field(p, "obfs"),
                    _ => str_field(p, "obfs-password"),
                },
                up_mbps: mbps("up"),
                down_mbps: mbps("down"),
                congestion_control: str_field(p, "congestion-controller"),
                udp_relay_mode: str_field(p, "udp-relay-mode"),
                sni: transport.sni,
                alpn: transport.alpn,
                allow_insecure: transport.allow_insecure,
            })
        }
        other => return Err(format!("unsupported clash proxy type '{other}'")),
    };
    let name = match str_field(p, "name") {
        n if n.is_empty() => format!("{kind}-{}", str_field(p, "server")),
        n => n,
    };
    Ok(Some(Candidate::new(name, bean)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    const SS_LINK: &str = "ss://YWVzLTI1Ni1nY206cGFzc3dvcmQxMjM@1.2.3.4:8388#ss1";
    const TROJAN_LINK: &str = "trojan://pw@t.example.com:443#t1";

    #[test]
    fn detect_base64_format() {
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{SS_LINK}\n{TROJAN_LINK}"));
        assert_eq!(detect_format(&encoded), SubFormat::Base64);
    }

    #[test]
    fn detect_clash_yaml_format() {
        let yaml = "proxies:\n  - name: test\n    type: ss\n";
        assert_eq!(detect_format(yaml), SubFormat::ClashYaml);
    }

    #[test]
    fn detect_singbox_json_format() {
        assert_eq!(detect_format(r#"{"outbounds": []}"#), SubFormat::SingBoxJson);
    }

    #[test]
    fn detect_sip008_format() {
        let json = r#"{"version": 1, "servers": [{"server": "1.2.3.4", "server_port": 8388}]}"#;
        assert_eq!(detect_format(json), SubFormat::Sip008);
    }

    #[test]
    fn plain_list_is_not_mistaken_for_base64() {
        assert_eq!(detect_format(TROJAN_LINK), SubFormat::LinkList);
    }

    #[test]
    fn link_list_skips_bad_lines_and_comments() {
        let content = format!("# comment\n{SS_LINK}\n\nnot-a-link\nfoo://bar\n{TROJAN_LINK}\n");
        let parsed = parse_subscription(&content).unwrap();
        assert_eq!(parsed.format, SubFormat::LinkList);
        assert_eq!(parsed.candidates.len(), 2);
        assert_eq!(parsed.skipped, 2);
    }

    #[test]
    fn base64_list_parsed() {
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{SS_LINK}\n{TROJAN_LINK}\n"));
        let parsed = parse_subscription(&encoded).unwrap();
        assert_eq!(parsed.format, SubFormat::Base64);
        let names: Vec<_> = parsed.candidates.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["ss1", "t1"]);
    }

    #[test]
    fn parse_clash_yaml_basic() {
        let yaml = r#"
proxies:
  - name: "ss-node"
    type: ss
    server: 1.2.3.4
    port: 8388
    cipher: aes-256-gcm
    password: "test123"
  - name: "trojan-node"
    type: trojan
    server: 5.6.7.8
    port: 443
    password: "pass"
    network: ws
    ws-opts:
      path: /ws
      headers:
        Host: cdn.example.com
  - name: "broken"
    type: wireguard
    server: 9.9.9.9
    port: 51820
"#;
        let parsed = parse_subscription(yaml).unwrap();
        assert_eq!(parsed.candidates.len(), 2);
        assert_eq!(parsed.skipped, 1);
        let ProxyBean::Trojan(t) = &parsed.candidates[1].bean else {
            panic!("not trojan")
        };
        assert_eq!(t.transport.host, "cdn.example.com");
        assert_eq!(t.transport.security(), "tls");
    }

    #[test]
    fn parse_singbox_json_basic() {
        let json = r#"{
            "outbounds": [
                {"type": "direct", "tag": "direct"},
                {"type": "vless", "tag": "my-vless", "server": "example.com", "server_port": 443, "uuid": "b831381d-6324-4d53-ad4f-8cda48b30811",
                 "tls": {"enabled": true, "server_name": "example.com", "reality": {"enabled": true, "public_key": "K"}}},
                {"type": "trojan", "tag": "my-trojan", "server": "trojan.com", "server_port": 443, "password": "pass"}
            ]
        }"#;
        let parsed = parse_subscription(json).unwrap();
        assert_eq!(parsed.candidates.len(), 2); // direct is ignored, not skipped
        assert_eq!(parsed.skipped, 0);
        assert_eq!(parsed.candidates[0].name, "my-vless");
        let ProxyBean::Vless(v) = &parsed.candidates[0].bean else {
            panic!("not vless")
        };
        assert_eq!(v.transport.security(), "reality");
    }

    #[test]
    fn parse_sip008_basic() {
        let json = r#"{
            "version": 1,
            "servers": [
                {"id": "id1", "remarks": "US Node", "server": "1.2.3.4", "server_port": 8388,
                 "password": "pass123", "method": "aes-256-gcm"},
                {"server": "5.6.7.8", "server_port": 8389, "password": "pass456",
                 "method": "chacha20-ietf-poly1305", "plugin": "obfs-local"}
            ]
        }"#;
        let parsed = parse_subscription(json).unwrap();
        assert_eq!(parsed.format, SubFormat::Sip008);
        assert_eq!(parsed.candidates[0].name, "US Node");
        assert_eq!(parsed.candidates[1].name, "ss-1");
    }

    #[test]
    fn duplicates_collapse_first_wins() {
        let content = format!("{SS_LINK}\n{}\n", SS_LINK.replace("#ss1", "#again"));
        let parsed = parse_subscription(&content).unwrap();
        assert_eq!(parsed.candidates.len(), 1);
        assert_eq!(parsed.candidates[0].name, "ss1");
        assert_eq!(parsed.duplicates, 1);
    }

    #[test]
    fn all_garbage_is_an_error() {
        assert!(matches!(
            parse_subscription("nothing useful here\nstill nothing"),
            Err(ParseError::NoEntries { skipped: 2, .. })
        ));
        assert!(matches!(parse_subscription("  \n"), Err(ParseError::Empty)));
    }
}
