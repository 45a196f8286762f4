use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::Issues;

/// 传输层 + 安全层参数，多数协议共用
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// tcp / ws / http / grpc / quic / httpupgrade
    pub network: String,
    pub path: String,
    pub host: String,
    pub service_name: String,
    /// none / tls / reality
    pub security: String,
    pub sni: String,
    pub alpn: Vec<String>,
    pub allow_insecure: bool,
    pub fingerprint: String,
    pub reality_public_key: String,
    pub reality_short_id: String,
}

impl TransportSettings {
    pub fn network(&self) -> &str {
        if self.network.is_empty() {
            "tcp"
        } else {
            &self.network
        }
    }

    pub fn security(&self) -> &str {
        if self.security.is_empty() {
            "none"
        } else {
            &self.security
        }
    }

    /// grpc / quic / 带 TLS 的 http 自带多路复用，不再叠加 mux
    pub fn carries_mux(&self) -> bool {
        match self.network() {
            "grpc" | "quic" => true,
            "http" => self.security() == "tls",
            _ => false,
        }
    }

    pub fn tls_enabled(&self) -> bool {
        matches!(self.security(), "tls" | "reality")
    }

    pub fn validate(&self, issues: &mut Issues) {
        match self.network() {
            "tcp" | "ws" | "http" | "grpc" | "quic" | "httpupgrade" => {}
            other => issues.push("transport.network", format!("unsupported network '{other}'")),
        }
        match self.security() {
            "none" | "tls" => {}
            "reality" => {
                if self.reality_public_key.is_empty() {
                    issues.push("transport.reality_public_key", "required for reality");
                }
            }
            other => issues.push("transport.security", format!("unsupported security '{other}'")),
        }
    }

    /// 参与节点身份判定的参数
    pub fn identity_params(&self) -> Vec<String> {
        vec![
            self.network().to_string(),
            self.path.clone(),
            self.host.to_ascii_lowercase(),
            self.service_name.clone(),
            self.security().to_string(),
            self.sni.to_ascii_lowercase(),
        ]
    }

    /// 写入 outbound 的 `transport` 与 `tls` 字段
    pub fn apply(&self, outbound: &mut Map<String, Value>, default_sni: &str) {
        if let Some(transport) = self.transport_json() {
            outbound.insert("transport".into(), transport);
        }
        if self.tls_enabled() {
            outbound.insert("tls".into(), self.tls_json(default_sni));
        }
    }

    fn transport_json(&self) -> Option<Value> {
        let mut t = Map::new();
        match self.network() {
            "tcp" => return None,
            "ws" | "httpupgrade" => {
                t.insert("type".into(), json!(self.network()));
                if !self.path.is_empty() {
                    t.insert("path".into(), json!(self.path));
                }
                if !self.host.is_empty() {
                    if self.network() == "ws" {
                        t.insert("headers".into(), json!({ "Host": self.host }));
                    } else {
                        t.insert("host".into(), json!(self.host));
                    }
                }
            }
            "http" => {
                t.insert("type".into(), json!("http"));
                if !self.path.is_empty() {
                    t.insert("path".into(), json!(self.path));
                }
                if !self.host.is_empty() {
                    let hosts: Vec<&str> = self.host.split(',').map(str::trim).collect();
                    t.insert("host".into(), json!(hosts));
                }
            }
            "grpc" => {
                t.insert("type".into(), json!("grpc"));
                if !self.service_name.is_empty() {
                    t.insert("service_name".into(), json!(self.service_name));
                }
            }
            "quic" => {
                t.insert("type".into(), json!("quic"));
            }
            _ => return None,
        }
        Some(Value::Object(t))
    }

    /// 独立 TLS 对象，QUIC 系协议也复用它
    pub fn tls_json(&self, default_sni: &str) -> Value {
        let mut tls = Map::new();
        tls.insert("enabled".into(), json!(true));
        let sni = if self.sni.is_empty() { default_sni } else { &self.sni };
        if !sni.is_empty() {
            tls.insert("server_name".into(), json!(sni));
        }
        if self.allow_insecure {
            tls.insert("insecure".into(), json!(true));
        }
        if !self.alpn.is_empty() {
            tls.insert("alpn".into(), json!(self.alpn));
        }
        if !self.fingerprint.is_empty() {
            tls.insert(
                "utls".into(),
                json!({ "enabled": true, "fingerprint": self.fingerprint }),
            );
        }
        if self.security() == "reality" {
            let mut reality = Map::new();
            reality.insert("enabled".into(), json!(true));
            reality.insert("public_key".into(), json!(self.reality_public_key));
            if !self.reality_short_id.is_empty() {
                reality.insert("short_id".into(), json!(self.reality_short_id));
            }
            tls.insert("reality".into(), Value::Object(reality));
            if self.fingerprint.is_empty() {
                tls.insert(
                    "utls".into(),
                    json!({ "enabled": true, "fingerprint": "chrome" }),
                );
            }
        }
        Value::Object(tls)
    }

    /// 分享链接 query 参数（vless / trojan 通用格式）
    pub fn to_query(&self, query: &mut Vec<(String, String)>) {
        query.push(("type".into(), self.network().to_string()));
        if !self.path.is_empty() {
            query.push(("path".into(), self.path.clone()));
        }
        if !self.host.is_empty() {
            query.push(("host".into(), self.host.clone()));
        }
        if !self.service_name.is_empty() {
            query.push(("serviceName".into(), self.service_name.clone()));
        }
        query.push(("security".into(), self.security().to_string()));
        if !self.sni.is_empty() {
            query.push(("sni".into(), self.sni.clone()));
        }
        if !self.alpn.is_empty() {
            query.push(("alpn".into(), self.alpn.join(",")));
        }
        if self.allow_insecure {
            query.push(("allowInsecure".into(), "1".into()));
        }
        if !self.fingerprint.is_empty() {
            query.push(("fp".into(), self.fingerprint.clone()));
        }
        if !self.reality_public_key.is_empty() {
            query.push(("pbk".into(), self.reality_public_key.clone()));
        }
        if !self.reality_short_id.is_empty() {
            query.push(("sid".into(), self.reality_short_id.clone()));
        }
    }
}
