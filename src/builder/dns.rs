//! DNS 段生成

use serde_json::{json, Map, Value};

use crate::model::routing::{DnsFinal, SimpleDns};
use crate::model::{DnsSettings, RoutingProfile};

fn server(tag: &str, address: &str, detour: Option<&str>, strategy: &str) -> Value {
    let mut s = Map::new();
    s.insert("tag".into(), json!(tag));
    s.insert("address".into(), json!(address));
    if detour.is_some() {
        s.insert("address_resolver".into(), json!("dns-local"));
        s.insert("detour".into(), json!(detour));
    }
    if !strategy.is_empty() {
        s.insert("strategy".into(), json!(strategy));
    }
    Value::Object(s)
}

/// `remote_override` 来自组覆盖；`direct_servers` 为所有出站服务器中的域名
pub(crate) fn build_dns(
    routing: &RoutingProfile,
    remote_override: Option<&str>,
    direct_servers: &[String],
) -> Value {
    match &routing.dns {
        DnsSettings::Object { object } => object.clone(),
        DnsSettings::Simple(simple) => build_simple(simple, routing, remote_override, direct_servers),
    }
}

fn build_simple(
    simple: &SimpleDns,
    routing: &RoutingProfile,
    remote_override: Option<&str>,
    direct_servers: &[String],
) -> Value {
    let remote = remote_override.unwrap_or(&simple.remote);
    let direct = match simple.direct.as_str() {
        "localhost" => "local",
        other => other,
    };

    let mut servers = vec![
        server("dns-remote", remote, Some("proxy"), &simple.remote_strategy),
        server("dns-direct", direct, Some("direct"), &simple.direct_strategy),
        server("dns-block", "rcode://success", None, ""),
    ];
    let mut rules = Vec::new();
    let mut dns = Map::new();

    if routing.fake_ip {
        servers.push(server("dns-fake", "fakeip", None, ""));
        dns.insert(
            "fakeip".into(),
            json!({
                "enabled": true,
                "inet4_range": "198.18.0.0/15",
                "inet6_range": "fc00::/18",
            }),
        );
        dns.insert("independent_cache".into(), json!(true));
        rules.push(json!({"outbound": "any", "server": "dns-local"}));
        rules.push(json!({"query_type": ["A", "AAAA"], "server": "dns-fake"}));
    }
    servers.push(json!({"tag": "dns-local", "address": "local", "detour": "direct"}));

    let mut direct_rule = routing.direct_domains();
    if !direct_servers.is_empty() {
        let mut domains: Vec<Value> = direct_servers.iter().map(|s| json!(s)).collect();
        if let Some(Value::Array(existing)) = direct_rule.remove("domain") {
            domains.extend(existing);
        }
        direct_rule.insert("domain".into(), Value::Array(domains));
    }
    if !direct_rule.is_empty() {
        direct_rule.insert("server".into(), json!("dns-direct"));
        rules.push(Value::Object(direct_rule));
    }

    let final_server = match simple.final_server {
        DnsFinal::Remote => "dns-remote",
        DnsFinal::Direct => "dns-direct",
    };
    dns.insert("servers".into(), Value::Array(servers));
    dns.insert("rules".into(), Value::Array(rules));
    dns.insert("final".into(), json!(final_server));
    Value::Object(dns)
}

/// 测速文档只需要能解析服务器地址
pub(crate) fn probe_dns() -> Value {
    json!({
        "servers": [{"tag": "dns-local", "address": "local", "detour": "direct"}],
    })
}
