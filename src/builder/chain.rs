//! 链式代理展开与逐跳 outbound 生成
//!
//! chain 的成员按连接顺序排列：第一个直连，最后一个连接目标。
//! 生成时倒序遍历，入口 hop 使用调用方给出的 tag，
//! 内层 hop 通过 `detour` 串起来；需要外部辅助程序的 hop
//! 改为本地 socks + mapping 入站转发。

use std::net::IpAddr;
use std::path::PathBuf;

use serde_json::{json, Map, Value};

use super::{ConfigValidationError, ExternalProcessSpec, ProfileLookup};
use crate::common::net::free_local_port;
use crate::config::enhance::merge_json;
use crate::config::types::MuxSettings;
use crate::model::{Issues, MuxState, Profile, ProfileId};

/// 把 profile 展开为实际连接的 hop 列表；chain 可以嵌套，但不能成环
pub(crate) fn flatten<'a, L: ProfileLookup + ?Sized>(
    lookup: &'a L,
    profile: &'a Profile,
    stack: &mut Vec<ProfileId>,
    out: &mut Vec<&'a Profile>,
) -> Result<(), ConfigValidationError> {
    let Some(members) = profile.bean.chain_members() else {
        out.push(profile);
        return Ok(());
    };
    if let Some(pos) = stack.iter().position(|id| *id == profile.id) {
        let mut path = stack[pos..].to_vec();
        path.push(profile.id);
        return Err(ConfigValidationError::ChainCycle {
            entity: profile.label(),
            path,
        });
    }
    stack.push(profile.id);
    for id in members {
        let member = lookup
            .profile(*id)
            .ok_or_else(|| ConfigValidationError::MissingProfile {
                entity: profile.label(),
                id: *id,
            })?;
        flatten(lookup, member, stack, out)?;
    }
    stack.pop();
    Ok(())
}

/// 一次展开得到的全部产物，失败时整体丢弃
#[derive(Debug, Default)]
pub(crate) struct Fragment {
    pub outbounds: Vec<Map<String, Value>>,
    pub inbounds: Vec<Value>,
    pub rules: Vec<Value>,
    /// 需要直连 DNS 解析的服务器域名
    pub direct_servers: Vec<String>,
    pub external: Vec<ExternalProcessSpec>,
}

impl Fragment {
    pub fn append(&mut self, other: Fragment) {
        self.outbounds.extend(other.outbounds);
        self.inbounds.extend(other.inbounds);
        self.rules.extend(other.rules);
        for server in other.direct_servers {
            push_unique(&mut self.direct_servers, server);
        }
        self.external.extend(other.external);
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

/// 辅助程序端口分配
#[derive(Debug)]
pub(crate) enum PortAllocator {
    /// 运行配置：从基础端口顺序递增，相同输入得到相同文档
    Sequential { next: u16 },
    /// 测速配置：每个端口临时向系统申请，不与运行中的 core 或并发的测速相撞
    Ephemeral { taken: Vec<u16>, fallback: u16 },
}

impl PortAllocator {
    pub fn sequential(base: u16) -> Self {
        Self::Sequential { next: base }
    }

    /// `reserved` 是文档里已经占用的端口，如测速入站
    pub fn ephemeral(reserved: &[u16], fallback: u16) -> Self {
        Self::Ephemeral {
            taken: reserved.to_vec(),
            fallback,
        }
    }

    /// 标记端口已被文档里别的入站占用
    pub fn reserve(&mut self, port: u16) {
        if let PortAllocator::Ephemeral { taken, .. } = self {
            taken.push(port);
        }
    }

    pub fn take(&mut self) -> u16 {
        match self {
            PortAllocator::Sequential { next } => bump(next),
            PortAllocator::Ephemeral { taken, fallback } => {
                for _ in 0..8 {
                    match free_local_port() {
                        Ok(port) if !taken.contains(&port) => {
                            taken.push(port);
                            return port;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "cannot reserve helper port, using fallback range");
                            break;
                        }
                    }
                }
                let mut port = bump(fallback);
                while taken.contains(&port) {
                    port = bump(fallback);
                }
                taken.push(port);
                port
            }
        }
    }
}

fn bump(next: &mut u16) -> u16 {
    let port = *next;
    *next = next.wrapping_add(1).max(1024);
    port
}

pub(crate) struct ChainContext<'a> {
    pub extra_cores: &'a std::collections::BTreeMap<String, PathBuf>,
    pub domain_strategy: &'a str,
    pub mux: &'a MuxSettings,
    pub ports: &'a mut PortAllocator,
}

/// 全局设置与 profile 开关共同决定是否挂 `multiplex`；
/// `max_streams` 为 0 时全局关闭
fn multiplex(hop: &Profile, settings: &MuxSettings) -> Option<Value> {
    if settings.max_streams == 0 || !hop.bean.protocol().supports_mux() {
        return None;
    }
    let enabled = match hop.mux {
        MuxState::Default => settings.default_on,
        MuxState::On => true,
        MuxState::Off => false,
    };
    enabled.then(|| {
        json!({
            "enabled": true,
            "protocol": settings.protocol,
            "max_streams": settings.max_streams,
            "padding": settings.padding,
        })
    })
}

/// 校验每一跳，收集全部问题后一次性报告
pub(crate) fn validate_hops(
    hops: &[&Profile],
    extra_cores: &std::collections::BTreeMap<String, PathBuf>,
) -> Vec<Issues> {
    let chained = hops.len() > 1;
    hops.iter()
        .map(|hop| {
            let mut issues = Issues::new(hop.label());
            let protocol = hop.bean.protocol();
            protocol.validate(&mut issues);
            if chained && hop.bean.full_document().is_some() {
                issues.push("mode", "a full document cannot be part of a chain");
            }
            if let Some(helper) = protocol.helper() {
                if !extra_cores.contains_key(helper) {
                    issues.push(
                        format!("extra_cores.{helper}"),
                        "helper program is not configured",
                    );
                }
            }
            if let Some(custom) = &hop.custom_outbound {
                if !custom.is_object() {
                    issues.push("custom_outbound", "must be a JSON object");
                }
            }
            issues
        })
        .collect()
}

/// 为已校验的 hop 列表生成 outbound；`hops` 按连接顺序
pub(crate) fn build_chain(entry_tag: &str, hops: &[&Profile], ctx: &mut ChainContext<'_>) -> Fragment {
    let mut frag = Fragment::default();
    let n = hops.len();
    let mut past: Option<(String, bool)> = None;

    for (index, hop) in hops.iter().rev().enumerate() {
        let tag = if index == 0 {
            entry_tag.to_string()
        } else {
            format!("{entry_tag}-{}-{index}", hop.id)
        };
        let connects_directly = index + 1 == n;

        if let Some((past_tag, past_external)) = &past {
            if *past_external {
                frag.rules.push(json!({
                    "inbound": [format!("{past_tag}-mapping")],
                    "outbound": tag,
                }));
            } else if let Some(last) = frag.outbounds.last_mut() {
                last.insert("detour".into(), json!(tag));
            }
        }

        let protocol = hop.bean.protocol();
        let helper = protocol.helper();
        let mut outbound = match helper {
            Some(helper) => {
                let socks_port = ctx.ports.take();
                let mapping = (!connects_directly).then(|| ctx.ports.take());
                if let (Some(port), Some((server, server_port))) = (mapping, protocol.server()) {
                    frag.inbounds.push(json!({
                        "type": "direct",
                        "tag": format!("{tag}-mapping"),
                        "listen": "127.0.0.1",
                        "listen_port": port,
                        "override_address": server,
                        "override_port": server_port,
                    }));
                }
                if let (Some(program), Some(invocation)) = (
                    ctx.extra_cores.get(helper),
                    protocol.external(socks_port, mapping),
                ) {
                    frag.external.push(ExternalProcessSpec {
                        tag: tag.clone(),
                        program: program.clone(),
                        args: invocation.args,
                        socks_port,
                    });
                }
                let mut ob = protocol.to_outbound();
                ob.insert("server".into(), json!("127.0.0.1"));
                ob.insert("server_port".into(), json!(socks_port));
                ob
            }
            None => {
                let mut ob = protocol.to_outbound();
                if !ctx.domain_strategy.is_empty() {
                    ob.insert("domain_strategy".into(), json!(ctx.domain_strategy));
                }
                if let Some(mux) = multiplex(hop, ctx.mux) {
                    ob.insert("multiplex".into(), mux);
                }
                ob
            }
        };
        outbound.insert("tag".into(), json!(tag));
        if let Some(Value::Object(custom)) = &hop.custom_outbound {
            merge_json(&mut outbound, custom);
        }

        if let Some((server, _)) = protocol.server() {
            if server.parse::<IpAddr>().is_err() && !server.is_empty() {
                push_unique(&mut frag.direct_servers, server.to_string());
            }
        }

        frag.outbounds.push(outbound);
        past = Some((tag, helper.is_some()));
    }
    frag
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::model::bean::{ChainBean, NaiveBean, SocksBean};
    use crate::model::ProxyBean;

    fn socks(id: ProfileId, server: &str) -> Profile {
        Profile::new(
            id,
            format!("s{id}"),
            ProxyBean::Socks(SocksBean {
                server: server.into(),
                port: 1080,
                ..Default::default()
            }),
        )
    }

    fn chain(id: ProfileId, members: Vec<ProfileId>) -> Profile {
        Profile::new(id, format!("c{id}"), ProxyBean::Chain(ChainBean { members }))
    }

    fn store(profiles: Vec<Profile>) -> BTreeMap<ProfileId, Profile> {
        profiles.into_iter().map(|p| (p.id, p)).collect()
    }

    #[test]
    fn nested_chain_flattens_in_order() {
        let db = store(vec![
            socks(1, "a.example"),
            socks(2, "b.example"),
            socks(3, "c.example"),
            chain(10, vec![1, 2]),
            chain(11, vec![10, 3]),
        ]);
        let mut hops = Vec::new();
        flatten(&db, &db[&11], &mut Vec::new(), &mut hops).unwrap();
        let ids: Vec<_> = hops.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn transitive_cycle_detected() {
        let db = store(vec![
            socks(1, "a.example"),
            chain(10, vec![1, 11]),
            chain(11, vec![10]),
        ]);
        let err = flatten(&db, &db[&10], &mut Vec::new(), &mut Vec::new()).unwrap_err();
        match err {
            ConfigValidationError::ChainCycle { path, .. } => assert_eq!(path, vec![10, 11, 10]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn self_reference_detected() {
        let db = store(vec![chain(7, vec![7])]);
        let err = flatten(&db, &db[&7], &mut Vec::new(), &mut Vec::new()).unwrap_err();
        assert!(matches!(err, ConfigValidationError::ChainCycle { .. }));
    }

    #[test]
    fn missing_member_reported() {
        let db = store(vec![chain(7, vec![99])]);
        let err = flatten(&db, &db[&7], &mut Vec::new(), &mut Vec::new()).unwrap_err();
        assert!(matches!(err, ConfigValidationError::MissingProfile { id: 99, .. }));
    }

    #[test]
    fn hops_linked_by_detour() {
        let a = socks(1, "a.example");
        let b = socks(2, "1.2.3.4");
        let extra = BTreeMap::new();
        let mux = MuxSettings::default();
        let mut ports = PortAllocator::sequential(20000);
        let mut ctx = ChainContext {
            extra_cores: &extra,
            domain_strategy: "prefer_ipv4",
            mux: &mux,
            ports: &mut ports,
        };
        let frag = build_chain("proxy", &[&a, &b], &mut ctx);
        assert_eq!(frag.outbounds.len(), 2);
        assert_eq!(frag.outbounds[0]["tag"], "proxy");
        assert_eq!(frag.outbounds[0]["detour"], "proxy-1-1");
        assert_eq!(frag.outbounds[1]["tag"], "proxy-1-1");
        assert!(frag.outbounds[1].get("detour").is_none());
        assert_eq!(frag.outbounds[1]["domain_strategy"], "prefer_ipv4");
        assert_eq!(frag.direct_servers, vec!["a.example".to_string()]);
    }

    #[test]
    fn external_hop_uses_mapping_rule() {
        let a = socks(1, "a.example");
        let naive = Profile::new(
            2,
            "n",
            ProxyBean::Naive(NaiveBean {
                server: "n.example".into(),
                port: 443,
                username: "u".into(),
                password: "p".into(),
                ..Default::default()
            }),
        );
        let extra = BTreeMap::from([("naive".to_string(), PathBuf::from("/usr/bin/naive"))]);
        let mux = MuxSettings::default();
        let mut ports = PortAllocator::sequential(20000);
        let mut ctx = ChainContext {
            extra_cores: &extra,
            domain_strategy: "",
            mux: &mux,
            ports: &mut ports,
        };
        // a 直连，naive 经 a 出去
        let frag = build_chain("proxy", &[&a, &naive], &mut ctx);
        assert_eq!(frag.outbounds[0]["server"], "127.0.0.1");
        assert_eq!(frag.outbounds[0]["server_port"], 20000);
        assert!(frag.outbounds[0].get("detour").is_none());
        assert_eq!(frag.inbounds[0]["tag"], "proxy-mapping");
        assert_eq!(frag.inbounds[0]["listen_port"], 20001);
        assert_eq!(
            frag.rules[0],
            json!({"inbound": ["proxy-mapping"], "outbound": "proxy-1-1"})
        );
        assert_eq!(frag.external.len(), 1);
        assert!(frag.external[0]
            .args
            .contains(&"--listen=socks://127.0.0.1:20000".to_string()));
    }

    #[test]
    fn ephemeral_ports_skip_reserved() {
        let reserved = free_local_port().unwrap();
        let mut ports = PortAllocator::ephemeral(&[reserved], 20000);
        let taken: Vec<u16> = (0..4).map(|_| ports.take()).collect();
        assert!(!taken.contains(&reserved));
        let mut unique = taken.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), taken.len());
    }

    #[test]
    fn missing_helper_is_a_field_issue() {
        let naive = Profile::new(
            2,
            "n",
            ProxyBean::Naive(NaiveBean {
                server: "n.example".into(),
                port: 443,
                ..Default::default()
            }),
        );
        let issues = validate_hops(&[&naive], &BTreeMap::new());
        let fields: Vec<_> = issues
            .into_iter()
            .flat_map(Issues::into_vec)
            .map(|i| i.field)
            .collect();
        assert_eq!(fields, vec!["extra_cores.naive"]);
    }
}
