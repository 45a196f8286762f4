//! 分享链接解析
//!
//! 支持 socks / http(s) / ss / vmess / vless / trojan / hysteria / hy2 / tuic / naive。
//! 每条链接解析成一个 [`Candidate`]，失败返回 [`LinkError`]，由调用方计入 skipped。

use std::collections::BTreeMap;

use thiserror::Error;

use super::subscription::Candidate;
use crate::common::codec::{base64_decode, parse_host_port, parse_query, percent_decode};
use crate::model::bean::{
    NaiveBean, QuicBean, QuicVariant, ShadowsocksBean, SocksBean, SocksVariant, TrojanBean,
    VlessBean, VmessBean,
};
use crate::model::{ProxyBean, TransportSettings};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("unsupported link scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("malformed {scheme} link: {reason}")]
    Malformed { scheme: String, reason: String },
}

fn malformed(scheme: &str, reason: impl Into<String>) -> LinkError {
    LinkError::Malformed {
        scheme: scheme.to_string(),
        reason: reason.into(),
    }
}

/// `scheme://[userinfo@]host:port[/][?query][#fragment]`
struct LinkParts {
    scheme: String,
    userinfo: Option<String>,
    host: String,
    port: u16,
    query: BTreeMap<String, String>,
    fragment: String,
}

impl LinkParts {
    fn parse(link: &str) -> Result<Self, LinkError> {
        let (scheme, rest) = link
            .split_once("://")
            .ok_or_else(|| LinkError::UnsupportedScheme(link.chars().take(16).collect()))?;
        let scheme = scheme.to_ascii_lowercase();
        let (rest, fragment) = match rest.split_once('#') {
            Some((r, f)) => (r, percent_decode(f)),
            None => (rest, String::new()),
        };
        let (authority, query) = match rest.split_once('?') {
            Some((a, q)) => (a, parse_query(q)),
            None => (rest, BTreeMap::new()),
        };
        let authority = authority.trim_end_matches('/');
        let (userinfo, host_port) = match authority.rsplit_once('@') {
            Some((u, h)) => (Some(u.to_string()), h),
            None => (None, authority),
        };
        let (host, port) = parse_host_port(host_port)
            .ok_or_else(|| malformed(&scheme, format!("bad address '{host_port}'")))?;
        if port == 0 {
            return Err(malformed(&scheme, "port 0"));
        }
        Ok(Self {
            scheme,
            userinfo,
            host,
            port,
            query,
            fragment,
        })
    }

    fn name(&self) -> String {
        if self.fragment.trim().is_empty() {
            format!("{}:{}", self.host, self.port)
        } else {
            self.fragment.trim().to_string()
        }
    }

    fn q(&self, key: &str) -> String {
        self.query.get(key).cloned().unwrap_or_default()
    }

    fn flag(&self, keys: &[&str]) -> bool {
        keys.iter()
            .any(|k| matches!(self.query.get(*k).map(String::as_str), Some("1" | "true")))
    }

    /// `user:pass`，两部分分别 percent 解码
    fn credentials(&self) -> (String, String) {
        match &self.userinfo {
            None => (String::new(), String::new()),
            Some(u) => match u.split_once(':') {
                Some((a, b)) => (percent_decode(a), percent_decode(b)),
                None => (percent_decode(u), String::new()),
            },
        }
    }

    fn transport(&self, default_security: &str) -> TransportSettings {
        let network = match self.q("type").as_str() {
            "" => "tcp".to_string(),
            other => other.to_string(),
        };
        let security = match self.q("security").as_str() {
            "" => default_security.to_string(),
            other => other.to_string(),
        };
        let sni = match self.q("sni").as_str() {
            "" => self.q("peer"),
            s => s.to_string(),
        };
        TransportSettings {
            network,
            path: self.q("path"),
            host: self.q("host"),
            service_name: self.q("serviceName"),
            security,
            sni,
            alpn: split_list(&self.q("alpn")),
            allow_insecure: self.flag(&["allowInsecure", "insecure", "allow_insecure"]),
            fingerprint: self.q("fp"),
            reality_public_key: self.q("pbk"),
            reality_short_id: self.q("sid"),
        }
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(String::from)
        .collect()
}

/// 解析一条分享链接
pub fn parse_share_link(link: &str) -> Result<Candidate, LinkError> {
    let link = link.trim();
    let scheme = link
        .split_once("://")
        .map(|(s, _)| s.to_ascii_lowercase())
        .unwrap_or_default();
    match scheme.as_str() {
        "socks" | "socks4" | "socks4a" | "socks5" | "socks5h" | "http" | "https" => {
            parse_socks_link(link)
        }
        "ss" => parse_ss_link(link),
        "vmess" => parse_vmess_link(link),
        "vless" => parse_vless_link(link),
        "trojan" => parse_trojan_link(link),
        "hysteria" | "hysteria2" | "hy2" | "tuic" => parse_quic_link(link),
        "naive+https" | "naive+quic" => parse_naive_link(link),
        "" => Err(LinkError::UnsupportedScheme(link.chars().take(16).collect())),
        other => Err(LinkError::UnsupportedScheme(other.to_string())),
    }
}

fn parse_socks_link(link: &str) -> Result<Candidate, LinkError> {
    let parts = LinkParts::parse(link)?;
    let variant = match parts.scheme.as_str() {
        "socks4" => SocksVariant::Socks4,
        "socks4a" => SocksVariant::Socks4a,
        "http" | "https" => SocksVariant::Http,
        _ => SocksVariant::Socks5,
    };
    let (mut username, mut password) = parts.credentials();
    // 部分客户端把 user:pass 整体 base64
    if password.is_empty() && !username.is_empty() {
        if let Some((u, p)) = base64_decode(&username).as_deref().and_then(|d| d.split_once(':')) {
            (username, password) = (u.to_string(), p.to_string());
        }
    }
    let bean = SocksBean {
        variant,
        server: parts.host.clone(),
        port: parts.port,
        username,
        password,
        tls: parts.scheme == "https",
        sni: parts.q("sni"),
        allow_insecure: parts.flag(&["allowInsecure", "insecure"]),
    };
    Ok(Candidate::new(parts.name(), ProxyBean::Socks(bean)))
}

fn parse_ss_link(link: &str) -> Result<Candidate, LinkError> {
    let body = &link["ss://".len()..];
    let (main, fragment) = match body.split_once('#') {
        Some((m, f)) => (m, percent_decode(f)),
        None => (body, String::new()),
    };
    // 旧格式：整体 base64(method:password@host:port)
    let normalized = if !main.contains('@') {
        let (encoded, tail) = match main.split_once('?') {
            Some((e, q)) => (e.trim_end_matches('/'), format!("?{q}")),
            None => (main.trim_end_matches('/'), String::new()),
        };
        let decoded = base64_decode(encoded).ok_or_else(|| malformed("ss", "invalid base64"))?;
        let (user, server) = decoded
            .rsplit_once('@')
            .ok_or_else(|| malformed("ss", "missing server"))?;
        format!(
            "ss://{}@{server}{tail}#{fragment}",
            crate::common::codec::base64_url_encode(user)
        )
    } else {
        format!("ss://{main}#{fragment}")
    };

    let parts = LinkParts::parse(&normalized)?;
    let userinfo = parts
        .userinfo
        .clone()
        .ok_or_else(|| malformed("ss", "missing method and password"))?;
    let decoded_user = if userinfo.contains(':') {
        percent_decode(&userinfo)
    } else {
        base64_decode(&percent_decode(&userinfo))
            .ok_or_else(|| malformed("ss", "invalid base64 userinfo"))?
    };
    let (method, password) = decoded_user
        .split_once(':')
        .ok_or_else(|| malformed("ss", "userinfo must be method:password"))?;

    let (plugin, plugin_opts) = match parts.query.get("plugin") {
        Some(p) => match p.split_once(';') {
            Some((name, opts)) => (name.to_string(), opts.to_string()),
            None => (p.clone(), String::new()),
        },
        None => (String::new(), String::new()),
    };
    let bean = ShadowsocksBean {
        server: parts.host.clone(),
        port: parts.port,
        method: method.to_ascii_lowercase(),
        password: password.to_string(),
        plugin,
        plugin_opts,
        udp_over_tcp: parts.flag(&["uot"]),
    };
    Ok(Candidate::new(parts.name(), ProxyBean::Shadowsocks(bean)))
}

fn parse_vmess_link(link: &str) -> Result<Candidate, LinkError> {
    let body = &link["vmess://".len()..];
    let decoded = base64_decode(body.split('#').next().unwrap_or_default())
        .ok_or_else(|| malformed("vmess", "invalid base64"))?;
    let json: serde_json::Value =
        serde_json::from_str(&decoded).map_err(|e| malformed("vmess", e.to_string()))?;

    let text = |key: &str| -> String {
        match json.get(key) {
            Some(serde_json::Value::String(s)) => s.trim().to_string(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => String::new(),
        }
    };
    let server = text("add");
    let port: u16 = text("port")
        .parse()
        .map_err(|_| malformed("vmess", "invalid port"))?;
    let network = match text("net").as_str() {
        "" => "tcp".to_string(),
        "h2" => "http".to_string(),
        n => n.to_string(),
    };
    let path = text("path");
    let (path, service_name) = if network == "grpc" {
        (String::new(), path)
    } else {
        (path, String::new())
    };
    let transport = TransportSettings {
        network,
        path,
        host: text("host"),
        service_name,
        security: if text("tls") == "tls" { "tls".into() } else { "none".into() },
        sni: text("sni"),
        alpn: split_list(&text("alpn")),
        allow_insecure: false,
        fingerprint: text("fp"),
        ..Default::default()
    };
    let bean = VmessBean {
        server: server.clone(),
        port,
        uuid: text("id"),
        alter_id: text("aid").parse().unwrap_or(0),
        security: match text("scy").as_str() {
            "" => "auto".to_string(),
            s => s.to_string(),
        },
        transport,
    };
    let name = match text("ps") {
        n if n.is_empty() => format!("{server}:{port}"),
        n => n,
    };
    Ok(Candidate::new(name, ProxyBean::Vmess(bean)))
}

fn parse_vless_link(link: &str) -> Result<Candidate, LinkError> {
    let parts = LinkParts::parse(link)?;
    let uuid = parts
        .userinfo
        .as_deref()
        .map(percent_decode)
        .ok_or_else(|| malformed("vless", "missing uuid"))?;
    let bean = VlessBean {
        server: parts.host.clone(),
        port: parts.port,
        uuid,
        flow: parts.q("flow"),
        packet_encoding: parts.q("packetEncoding"),
        transport: parts.transport("none"),
    };
    Ok(Candidate::new(parts.name(), ProxyBean::Vless(bean)))
}

fn parse_trojan_link(link: &str) -> Result<Candidate, LinkError> {
    let parts = LinkParts::parse(link)?;
    let password = parts
        .userinfo
        .as_deref()
        .map(percent_decode)
        .ok_or_else(|| malformed("trojan", "missing password"))?;
    let bean = TrojanBean {
        server: parts.host.clone(),
        port: parts.port,
        password,
        transport: parts.transport("tls"),
    };
    Ok(Candidate::new(parts.name(), ProxyBean::Trojan(bean)))
}

fn parse_quic_link(link: &str) -> Result<Candidate, LinkError> {
    let parts = LinkParts::parse(link)?;
    let mut bean = QuicBean {
        server: parts.host.clone(),
        port: parts.port,
        alpn: split_list(&parts.q("alpn")),
        allow_insecure: parts.flag(&["insecure", "allow_insecure", "allowInsecure"]),
        ..Default::default()
    };
    bean.sni = match parts.q("sni").as_str() {
        "" => parts.q("peer"),
        s => s.to_string(),
    };
    match parts.scheme.as_str() {
        "hysteria" => {
            bean.variant = QuicVariant::Hysteria;
            bean.password = parts.q("auth");
            bean.obfs_password = parts.q("obfsParam");
            bean.up_mbps = parts.q("upmbps").parse().unwrap_or(0);
            bean.down_mbps = parts.q("downmbps").parse().unwrap_or(0);
        }
        "tuic" => {
            bean.variant = QuicVariant::Tuic;
            let (uuid, password) = parts.credentials();
            bean.uuid = uuid;
            bean.password = password;
            bean.congestion_control = parts.q("congestion_control");
            bean.udp_relay_mode = parts.q("udp_relay_mode");
        }
        _ => {
            bean.variant = QuicVariant::Hysteria2;
            let (user, pass) = parts.credentials();
            // hy2://user:pass@ 也是合法写法，整体作为 password
            bean.password = if pass.is_empty() { user } else { format!("{user}:{pass}") };
            if parts.q("obfs") == "salamander" {
                bean.obfs_password = parts.q("obfs-password");
            }
        }
    }
    Ok(Candidate::new(parts.name(), ProxyBean::Quic(bean)))
}

fn parse_naive_link(link: &str) -> Result<Candidate, LinkError> {
    let parts = LinkParts::parse(link)?;
    let (username, password) = parts.credentials();
    let bean = NaiveBean {
        server: parts.host.clone(),
        port: parts.port,
        username,
        password,
        protocol: parts.scheme.trim_start_matches("naive+").to_string(),
        sni: parts.q("sni"),
        concurrency: 0,
    };
    Ok(Candidate::new(parts.name(), ProxyBean::Naive(bean)))
}
