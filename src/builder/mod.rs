//! Core 配置生成
//!
//! 输入是某一时刻的 profile 快照、生效的路由配置和组覆盖项，输出校验过的
//! sing-box 风格文档。纯函数：不读写注册表，相同输入得到逐字节相同的输出。
//!
//! 覆盖顺序（后者优先）：内置默认值 → 路由配置 → 组覆盖 → profile 自身的
//! `custom_outbound` / `custom_config`。

mod chain;
mod dns;
mod document;
mod error;
mod route;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::{json, Map, Value};

use crate::config::enhance::merge_json;
use crate::config::types::{ClashApiSettings, InboundSettings, MuxSettings, NtpSettings};
use crate::config::Settings;
use crate::model::{
    FieldIssue, GroupOverrides, Issues, Profile, ProfileId, RoutingProfile, SniffingMode,
};
use crate::store::ProfileData;

use chain::{build_chain, flatten, validate_hops, ChainContext, Fragment, PortAllocator};

pub use document::{CoreConfigDocument, ExternalProcessSpec};
pub use error::ConfigValidationError;

/// 按 id 查找 profile，chain 展开时使用
pub trait ProfileLookup {
    fn profile(&self, id: ProfileId) -> Option<&Profile>;
}

impl ProfileLookup for ProfileData {
    fn profile(&self, id: ProfileId) -> Option<&Profile> {
        ProfileData::profile(self, id)
    }
}

impl ProfileLookup for BTreeMap<ProfileId, Profile> {
    fn profile(&self, id: ProfileId) -> Option<&Profile> {
        self.get(&id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// 交给监控器运行的完整配置
    Run { tun: bool },
    /// 一次性测速：只有一个监听 `listen_port` 的 mixed 入站
    Test { listen_port: u16 },
}

/// 生成器用到的设置子集
#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub core_log_level: String,
    pub inbound: InboundSettings,
    pub extra_cores: BTreeMap<String, PathBuf>,
    pub external_port_base: u16,
    pub rule_set_dir: PathBuf,
    pub clash_api: Option<ClashApiSettings>,
    pub mux: MuxSettings,
    pub ntp: NtpSettings,
}

impl GeneratorSettings {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            core_log_level: settings.log.core_level.clone(),
            inbound: settings.inbound.clone(),
            extra_cores: settings.extra_cores.clone(),
            external_port_base: settings.external_port_base,
            rule_set_dir: settings.rule_set_dir(),
            clash_api: settings.clash_api.clone(),
            mux: settings.mux.clone(),
            ntp: settings.ntp.clone(),
        }
    }
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// 批量测速文档
#[derive(Debug)]
pub struct TestBatch {
    pub document: CoreConfigDocument,
    /// profile → 该 profile 专用的本地 mixed 端口
    pub ports: BTreeMap<ProfileId, u16>,
    pub skipped: Vec<(ProfileId, ConfigValidationError)>,
}

/// 路由配置叠加组覆盖后的生效值
struct Effective<'a> {
    sniffing: SniffingMode,
    domain_strategy: &'a str,
    outbound_domain_strategy: &'a str,
    default_outbound: &'a str,
    remote_dns: Option<&'a str>,
    front_proxy: Option<ProfileId>,
    landing_proxy: Option<ProfileId>,
}

impl<'a> Effective<'a> {
    fn resolve(routing: &'a RoutingProfile, overrides: Option<&'a GroupOverrides>) -> Self {
        let mut eff = Effective {
            sniffing: routing.sniffing,
            domain_strategy: &routing.domain_strategy,
            outbound_domain_strategy: &routing.outbound_domain_strategy,
            default_outbound: &routing.default_outbound,
            remote_dns: None,
            front_proxy: None,
            landing_proxy: None,
        };
        if let Some(o) = overrides.filter(|o| o.apply) {
            if let Some(s) = o.sniffing {
                eff.sniffing = s;
            }
            if let Some(s) = &o.outbound_domain_strategy {
                eff.outbound_domain_strategy = s;
            }
            if let Some(s) = &o.default_outbound {
                eff.default_outbound = s;
            }
            eff.remote_dns = o.remote_dns.as_deref();
            eff.front_proxy = o.front_proxy;
            eff.landing_proxy = o.landing_proxy;
        }
        eff
    }
}

pub struct ConfigGenerator {
    settings: GeneratorSettings,
}

impl ConfigGenerator {
    pub fn new(settings: GeneratorSettings) -> Self {
        Self { settings }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(GeneratorSettings::from_settings(settings))
    }

    pub fn settings(&self) -> &GeneratorSettings {
        &self.settings
    }

    /// 生成 `profile` 的配置；失败时列出所有问题而不只是第一个
    pub fn generate<L: ProfileLookup + ?Sized>(
        &self,
        lookup: &L,
        profile: &Profile,
        routing: &RoutingProfile,
        overrides: Option<&GroupOverrides>,
        mode: BuildMode,
    ) -> Result<CoreConfigDocument, ConfigValidationError> {
        if profile.bean.full_document().is_some() {
            return self.full_document(profile, mode);
        }
        let run = matches!(mode, BuildMode::Run { .. });
        let eff = Effective::resolve(routing, overrides);

        // 连接顺序：前置代理 → profile 自身 → 落地代理
        let mut hops = Vec::new();
        if run {
            self.extend_hops(lookup, profile, eff.front_proxy, "front_proxy", &mut hops)?;
        }
        flatten(lookup, profile, &mut Vec::new(), &mut hops)?;
        if run {
            self.extend_hops(lookup, profile, eff.landing_proxy, "landing_proxy", &mut hops)?;
        }

        let mut issues = self.hop_issues(profile, &hops);
        let mut routed = Vec::new();
        if run {
            let mut route_issues = Issues::new(routing.label());
            routing.validate(&mut route_issues);
            if !matches!(eff.default_outbound, "proxy" | "direct" | "block") {
                route_issues.push(
                    "overrides.default_outbound",
                    format!("unknown outbound '{}'", eff.default_outbound),
                );
            }
            issues.extend(route_issues.into_vec());

            for id in routing.used_profiles() {
                let target = lookup
                    .profile(id)
                    .ok_or_else(|| ConfigValidationError::MissingProfile {
                        entity: routing.label(),
                        id,
                    })?;
                let mut target_hops = Vec::new();
                flatten(lookup, target, &mut Vec::new(), &mut target_hops)?;
                issues.extend(self.hop_issues(target, &target_hops));
                routed.push((id, target_hops));
            }
        }
        if !issues.is_empty() {
            return Err(ConfigValidationError::InvalidFields {
                entity: profile.label(),
                issues,
            });
        }

        let mut ports = match mode {
            BuildMode::Run { .. } => PortAllocator::sequential(self.settings.external_port_base),
            BuildMode::Test { listen_port } => {
                PortAllocator::ephemeral(&[listen_port], self.settings.external_port_base)
            }
        };
        let mut ctx = ChainContext {
            extra_cores: &self.settings.extra_cores,
            domain_strategy: eff.outbound_domain_strategy,
            mux: &self.settings.mux,
            ports: &mut ports,
        };
        let mut frag = build_chain("proxy", &hops, &mut ctx);
        let mut profile_tags = BTreeMap::new();
        for (n, (id, target_hops)) in routed.iter().enumerate() {
            let tag = format!("rout-{n}");
            frag.append(build_chain(&tag, target_hops, &mut ctx));
            profile_tags.insert(*id, tag);
        }

        let external = std::mem::take(&mut frag.external);
        let mut doc = match mode {
            BuildMode::Run { tun } => self.run_document(routing, &eff, frag, &profile_tags, tun),
            BuildMode::Test { listen_port } => self.test_document(
                frag,
                vec![probe_inbound("probe-in", listen_port)],
                Vec::new(),
                "proxy",
            ),
        };
        if let (Value::Object(root), Some(Value::Object(custom))) = (&mut doc, &profile.custom_config) {
            merge_json(root, custom);
        }

        tracing::debug!(
            profile = profile.id,
            hops = hops.len(),
            external = external.len(),
            "core config generated"
        );
        Ok(CoreConfigDocument::new(doc, Some(profile.id), external))
    }

    /// 测速用配置，不含前置/落地代理与路由规则
    pub fn generate_test<L: ProfileLookup + ?Sized>(
        &self,
        lookup: &L,
        profile: &Profile,
        listen_port: u16,
    ) -> Result<CoreConfigDocument, ConfigValidationError> {
        let routing = RoutingProfile::new(0, "probe");
        self.generate(lookup, profile, &routing, None, BuildMode::Test { listen_port })
    }

    /// 多个 profile 合并进一个文档，每个 profile 一个专用入站；
    /// 无法生成的 profile 跳过并报告。入站端口依次取自 `listen_ports`
    pub fn generate_test_batch<L: ProfileLookup + ?Sized>(
        &self,
        lookup: &L,
        profiles: &[&Profile],
        listen_ports: impl IntoIterator<Item = u16>,
    ) -> TestBatch {
        let mut listen_ports = listen_ports.into_iter();
        let mut ports = PortAllocator::ephemeral(&[], self.settings.external_port_base);
        let mut frag = Fragment::default();
        let mut inbounds = Vec::new();
        let mut rules = Vec::new();
        let mut assigned = BTreeMap::new();
        let mut skipped = Vec::new();

        for profile in profiles {
            if profile.bean.full_document().is_some() {
                skipped.push((
                    profile.id,
                    invalid(profile, "mode", "full documents cannot be tested in a batch"),
                ));
                continue;
            }
            let mut hops = Vec::new();
            if let Err(e) = flatten(lookup, *profile, &mut Vec::new(), &mut hops) {
                skipped.push((profile.id, e));
                continue;
            }
            let issues = self.hop_issues(profile, &hops);
            if !issues.is_empty() {
                skipped.push((
                    profile.id,
                    ConfigValidationError::InvalidFields {
                        entity: profile.label(),
                        issues,
                    },
                ));
                continue;
            }

            let Some(port) = listen_ports.next() else {
                skipped.push((
                    profile.id,
                    invalid(profile, "listen_port", "no free probe port left"),
                ));
                continue;
            };
            ports.reserve(port);

            let tag = format!("test-{}", profile.id);
            let inbound_tag = format!("probe-in-{}", profile.id);
            let mut ctx = ChainContext {
                extra_cores: &self.settings.extra_cores,
                domain_strategy: "",
                mux: &self.settings.mux,
                ports: &mut ports,
            };
            frag.append(build_chain(&tag, &hops, &mut ctx));
            inbounds.push(probe_inbound(&inbound_tag, port));
            rules.push(json!({"inbound": [inbound_tag], "outbound": tag}));
            assigned.insert(profile.id, port);
        }

        for (id, err) in &skipped {
            tracing::debug!(profile = *id, error = %err, "profile skipped in test batch");
        }
        let external = std::mem::take(&mut frag.external);
        // 未匹配任何探测入站的流量不应该走出去
        let doc = self.test_document(frag, inbounds, rules, "block");
        TestBatch {
            document: CoreConfigDocument::new(doc, None, external),
            ports: assigned,
            skipped,
        }
    }

    fn extend_hops<'a, L: ProfileLookup + ?Sized>(
        &self,
        lookup: &'a L,
        root: &Profile,
        id: Option<ProfileId>,
        field: &str,
        hops: &mut Vec<&'a Profile>,
    ) -> Result<(), ConfigValidationError> {
        let Some(id) = id else {
            return Ok(());
        };
        let extra = lookup
            .profile(id)
            .ok_or_else(|| ConfigValidationError::MissingProfile {
                entity: format!("{} {field}", root.label()),
                id,
            })?;
        // 以 root 为起点，前置/落地代理也不能绕回自身
        let mut stack = vec![root.id];
        flatten(lookup, extra, &mut stack, hops)
    }

    fn hop_issues(&self, root: &Profile, hops: &[&Profile]) -> Vec<FieldIssue> {
        let mut issues = Vec::new();
        if root.bean.chain_members().is_some() {
            let mut own = Issues::new(root.label());
            root.bean.protocol().validate(&mut own);
            issues.extend(own.into_vec());
        }
        for hop in validate_hops(hops, &self.settings.extra_cores) {
            issues.extend(hop.into_vec());
        }
        if let Some(custom) = &root.custom_config {
            if !custom.is_object() {
                let mut own = Issues::new(root.label());
                own.push("custom_config", "must be a JSON object");
                issues.extend(own.into_vec());
            }
        }
        issues
    }

    fn full_document(
        &self,
        profile: &Profile,
        mode: BuildMode,
    ) -> Result<CoreConfigDocument, ConfigValidationError> {
        let mut issues = Issues::new(profile.label());
        profile.bean.protocol().validate(&mut issues);
        if !issues.is_empty() {
            return Err(ConfigValidationError::InvalidFields {
                entity: profile.label(),
                issues: issues.into_vec(),
            });
        }
        let mut doc = profile.bean.full_document().cloned().unwrap_or_default();
        if let (BuildMode::Test { listen_port }, Value::Object(root)) = (mode, &mut doc) {
            root.insert(
                "inbounds".into(),
                json!([probe_inbound("probe-in", listen_port)]),
            );
        }
        if let (Value::Object(root), Some(Value::Object(custom))) = (&mut doc, &profile.custom_config) {
            merge_json(root, custom);
        }
        Ok(CoreConfigDocument::new(doc, Some(profile.id), Vec::new()))
    }

    fn run_document(
        &self,
        routing: &RoutingProfile,
        eff: &Effective<'_>,
        frag: Fragment,
        profile_tags: &BTreeMap<ProfileId, String>,
        tun: bool,
    ) -> Value {
        let inbound = &self.settings.inbound;
        let mut inbounds = Vec::new();

        let mut mixed = Map::new();
        mixed.insert("type".into(), json!("mixed"));
        mixed.insert("tag".into(), json!("mixed-in"));
        mixed.insert("listen".into(), json!(inbound.address));
        mixed.insert("listen_port".into(), json!(inbound.mixed_port));
        apply_inbound_common(&mut mixed, eff);
        inbounds.push(Value::Object(mixed));

        if tun {
            let t = &inbound.tun;
            let mut address = vec![json!("172.19.0.1/24")];
            if t.ipv6 {
                address.push(json!("fdfe:dcba:9876::1/96"));
            }
            let mut tun_in = Map::new();
            tun_in.insert("type".into(), json!("tun"));
            tun_in.insert("tag".into(), json!("tun-in"));
            tun_in.insert("interface_name".into(), json!(t.interface_name));
            tun_in.insert("address".into(), Value::Array(address));
            tun_in.insert("mtu".into(), json!(t.mtu));
            tun_in.insert("stack".into(), json!(t.stack));
            tun_in.insert("auto_route".into(), json!(true));
            tun_in.insert("strict_route".into(), json!(t.strict_route));
            tun_in.insert("endpoint_independent_nat".into(), json!(true));
            apply_inbound_common(&mut tun_in, eff);
            inbounds.push(Value::Object(tun_in));
        }
        inbounds.extend(frag.inbounds);

        let dns = dns::build_dns(routing, eff.remote_dns, &frag.direct_servers);

        let mut rules = frag.rules;
        rules.extend(route::build_rules(routing, profile_tags));
        let mut route_obj = Map::new();
        route_obj.insert("rules".into(), Value::Array(rules));
        route_obj.insert("final".into(), json!(eff.default_outbound));
        let rule_sets = route::rule_set_entries(routing, &self.settings.rule_set_dir);
        if !rule_sets.is_empty() {
            route_obj.insert("rule_set".into(), Value::Array(rule_sets));
        }
        if tun {
            route_obj.insert("auto_detect_interface".into(), json!(true));
        }

        let mut doc = Map::new();
        doc.insert("log".into(), json!({"level": self.settings.core_log_level}));
        doc.insert("dns".into(), dns);
        doc.insert("inbounds".into(), Value::Array(inbounds));
        doc.insert("outbounds".into(), outbounds_with_builtins(frag.outbounds));
        doc.insert("route".into(), Value::Object(route_obj));
        let ntp = &self.settings.ntp;
        if ntp.enabled {
            doc.insert(
                "ntp".into(),
                json!({
                    "enabled": true,
                    "server": ntp.server,
                    "server_port": ntp.server_port,
                    "interval": ntp.interval,
                }),
            );
        }
        if let Some(api) = &self.settings.clash_api {
            doc.insert(
                "experimental".into(),
                json!({
                    "clash_api": {
                        "external_controller": format!("{}:{}", api.listen, api.port),
                        "secret": api.secret,
                    }
                }),
            );
        }
        Value::Object(doc)
    }

    fn test_document(
        &self,
        frag: Fragment,
        probe_inbounds: Vec<Value>,
        extra_rules: Vec<Value>,
        final_tag: &str,
    ) -> Value {
        let mut inbounds = probe_inbounds;
        inbounds.extend(frag.inbounds);
        let mut rules = frag.rules;
        rules.extend(extra_rules);

        let mut doc = Map::new();
        doc.insert("log".into(), json!({"level": self.settings.core_log_level}));
        doc.insert("dns".into(), dns::probe_dns());
        doc.insert("inbounds".into(), Value::Array(inbounds));
        doc.insert("outbounds".into(), outbounds_with_builtins(frag.outbounds));
        doc.insert("route".into(), json!({"rules": rules, "final": final_tag}));
        Value::Object(doc)
    }
}

fn invalid(profile: &Profile, field: &str, message: &str) -> ConfigValidationError {
    let mut issues = Issues::new(profile.label());
    issues.push(field, message);
    ConfigValidationError::InvalidFields {
        entity: profile.label(),
        issues: issues.into_vec(),
    }
}

fn probe_inbound(tag: &str, port: u16) -> Value {
    json!({
        "type": "mixed",
        "tag": tag,
        "listen": "127.0.0.1",
        "listen_port": port,
    })
}

fn apply_inbound_common(inbound: &mut Map<String, Value>, eff: &Effective<'_>) {
    if eff.sniffing != SniffingMode::Disable {
        inbound.insert("sniff".into(), json!(true));
        inbound.insert(
            "sniff_override_destination".into(),
            json!(eff.sniffing == SniffingMode::ForDestination),
        );
    }
    if !eff.domain_strategy.is_empty() {
        inbound.insert("domain_strategy".into(), json!(eff.domain_strategy));
    }
}

fn outbounds_with_builtins(outbounds: Vec<Map<String, Value>>) -> Value {
    let mut all: Vec<Value> = outbounds.into_iter().map(Value::Object).collect();
    all.push(json!({"type": "direct", "tag": "direct"}));
    all.push(json!({"type": "block", "tag": "block"}));
    all.push(json!({"type": "dns", "tag": "dns-out"}));
    Value::Array(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::model::bean::{
        ChainBean, CustomBean, CustomMode, NaiveBean, SocksBean, TrojanBean, VmessBean,
    };
    use crate::model::{MuxState, ProxyBean, RouteRule, RuleOutbound};

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

    fn db(profiles: Vec<Profile>) -> BTreeMap<ProfileId, Profile> {
        profiles.into_iter().map(|p| (p.id, p)).collect()
    }

    fn run() -> BuildMode {
        BuildMode::Run { tun: false }
    }

    fn outbound_tags(doc: &CoreConfigDocument) -> Vec<String> {
        doc.value()["outbounds"]
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o["tag"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn vmess_missing_server_lists_field() {
        let profile = Profile::new(
            1,
            "vm",
            ProxyBean::Vmess(VmessBean {
                port: 443,
                uuid: "b831381d-6324-4d53-ad4f-8cda48b30811".into(),
                ..Default::default()
            }),
        );
        let gen = ConfigGenerator::new(GeneratorSettings::default());
        let routing = RoutingProfile::builtin_default(1);
        let err = gen
            .generate(&db(vec![]), &profile, &routing, None, run())
            .unwrap_err();
        assert_eq!(err.fields(), vec!["server"]);
    }

    #[test]
    fn all_invalid_fields_reported_at_once() {
        let mut routing = RoutingProfile::new(1, "r");
        routing.rules.push(RouteRule::default());
        let profile = Profile::new(1, "empty", ProxyBean::Socks(SocksBean::default()));
        let gen = ConfigGenerator::new(GeneratorSettings::default());
        let err = gen
            .generate(&db(vec![]), &profile, &routing, None, run())
            .unwrap_err();
        assert_eq!(err.fields(), vec!["server", "port", "rules[0]"]);
    }

    #[test]
    fn output_is_deterministic() {
        let profiles = db(vec![socks(1, "a.example"), socks(2, "b.example")]);
        let mut routing = RoutingProfile::builtin_default(1);
        routing.rules.push(RouteRule {
            domain_suffix: vec!["corp".into()],
            outbound: RuleOutbound::Profile(2),
            ..Default::default()
        });
        let gen = ConfigGenerator::new(GeneratorSettings::default());
        let a = gen.generate(&profiles, &profiles[&1], &routing, None, run()).unwrap();
        let b = gen.generate(&profiles, &profiles[&1], &routing, None, run()).unwrap();
        assert_eq!(a.text(), b.text());
        assert_eq!(a.hash(), b.hash());
        assert_eq!(
            outbound_tags(&a),
            vec!["proxy", "rout-0", "direct", "block", "dns-out"]
        );
        let rules = a.value()["route"]["rules"].as_array().unwrap();
        assert_eq!(rules.last().unwrap()["outbound"], "rout-0");
    }

    #[test]
    fn group_overrides_applied_only_when_enabled() {
        let profiles = db(vec![socks(1, "a.example"), socks(2, "front.example")]);
        let routing = RoutingProfile::builtin_default(1);
        let mut overrides = GroupOverrides {
            apply: false,
            front_proxy: Some(2),
            sniffing: Some(SniffingMode::Disable),
            default_outbound: Some("direct".into()),
            ..Default::default()
        };
        let gen = ConfigGenerator::new(GeneratorSettings::default());

        let plain = gen
            .generate(&profiles, &profiles[&1], &routing, Some(&overrides), run())
            .unwrap();
        assert_eq!(plain.value()["route"]["final"], "proxy");
        assert_eq!(plain.value()["inbounds"][0]["sniff"], true);

        overrides.apply = true;
        let doc = gen
            .generate(&profiles, &profiles[&1], &routing, Some(&overrides), run())
            .unwrap();
        assert_eq!(doc.value()["route"]["final"], "direct");
        assert!(doc.value()["inbounds"][0].get("sniff").is_none());
        // 前置代理是第一跳
        assert_eq!(doc.value()["outbounds"][0]["detour"], "proxy-2-1");
        assert_eq!(doc.value()["outbounds"][1]["server"], "front.example");
    }

    #[test]
    fn front_proxy_cannot_loop_back() {
        let chain = Profile::new(3, "c", ProxyBean::Chain(ChainBean { members: vec![1] }));
        let wrapper = Profile::new(4, "w", ProxyBean::Chain(ChainBean { members: vec![3] }));
        let profiles = db(vec![socks(1, "a.example"), chain, wrapper]);
        let overrides = GroupOverrides {
            apply: true,
            front_proxy: Some(4),
            ..Default::default()
        };
        let gen = ConfigGenerator::new(GeneratorSettings::default());
        let err = gen
            .generate(
                &profiles,
                &profiles[&3],
                &RoutingProfile::builtin_default(1),
                Some(&overrides),
                run(),
            )
            .unwrap_err();
        assert!(matches!(err, ConfigValidationError::ChainCycle { .. }));
    }

    #[test]
    fn profile_customizations_win() {
        let mut p = socks(1, "a.example");
        p.custom_outbound = Some(json!({"udp_over_tcp": true, "server_port": 2000}));
        p.custom_config = Some(json!({"log": {"level": "debug"}}));
        let profiles = db(vec![p]);
        let gen = ConfigGenerator::new(GeneratorSettings::default());
        let doc = gen
            .generate(&profiles, &profiles[&1], &RoutingProfile::builtin_default(1), None, run())
            .unwrap();
        assert_eq!(doc.value()["outbounds"][0]["server_port"], 2000);
        assert_eq!(doc.value()["outbounds"][0]["udp_over_tcp"], true);
        assert_eq!(doc.value()["log"]["level"], "debug");
    }

    #[test]
    fn tun_and_clash_api_sections() {
        let mut settings = GeneratorSettings::default();
        settings.clash_api = Some(ClashApiSettings {
            listen: "127.0.0.1".into(),
            port: 9090,
            secret: "s".into(),
        });
        let profiles = db(vec![socks(1, "1.1.1.1")]);
        let gen = ConfigGenerator::new(settings);
        let doc = gen
            .generate(
                &profiles,
                &profiles[&1],
                &RoutingProfile::builtin_default(1),
                None,
                BuildMode::Run { tun: true },
            )
            .unwrap();
        let v = doc.value();
        assert_eq!(v["inbounds"][1]["type"], "tun");
        assert_eq!(v["route"]["auto_detect_interface"], true);
        assert_eq!(
            v["experimental"]["clash_api"]["external_controller"],
            "127.0.0.1:9090"
        );
        // IP 服务器不需要直连 DNS 规则
        assert!(v["dns"]["rules"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_build_has_only_probe_inbound() {
        let profiles = db(vec![socks(1, "a.example")]);
        let gen = ConfigGenerator::new(GeneratorSettings::default());
        let doc = gen.generate_test(&profiles, &profiles[&1], 31000).unwrap();
        let inbounds = doc.value()["inbounds"].as_array().unwrap();
        assert_eq!(inbounds.len(), 1);
        assert_eq!(inbounds[0]["listen_port"], 31000);
        assert_eq!(doc.value()["route"]["final"], "proxy");
        assert!(doc.value().get("experimental").is_none());
    }

    fn naive(id: ProfileId) -> Profile {
        Profile::new(
            id,
            format!("n{id}"),
            ProxyBean::Naive(NaiveBean {
                server: format!("n{id}.example"),
                port: 443,
                username: "u".into(),
                password: "p".into(),
                ..Default::default()
            }),
        )
    }

    #[test]
    fn test_builds_get_their_own_helper_ports() {
        let mut settings = GeneratorSettings::default();
        settings
            .extra_cores
            .insert("naive".into(), PathBuf::from("/usr/bin/naive"));
        let gen = Arc::new(ConfigGenerator::new(settings));
        let profiles = Arc::new(db(vec![naive(1), naive(2)]));

        let running = gen
            .generate(
                &*profiles,
                &profiles[&1],
                &RoutingProfile::builtin_default(1),
                None,
                run(),
            )
            .unwrap();
        let run_port = running.external()[0].socks_port;
        assert_eq!(run_port, gen.settings().external_port_base);

        let handles: Vec<_> = [(1, 40001), (2, 40002)]
            .into_iter()
            .map(|(id, listen)| {
                let gen = Arc::clone(&gen);
                let profiles = Arc::clone(&profiles);
                std::thread::spawn(move || {
                    let doc = gen.generate_test(&*profiles, &profiles[&id], listen).unwrap();
                    let helper = doc.external()[0].socks_port;
                    assert_eq!(
                        doc.value()["outbounds"][0]["server_port"],
                        json!(helper)
                    );
                    helper
                })
            })
            .collect();
        let ports: Vec<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_ne!(ports[0], ports[1]);
        assert!(!ports.contains(&run_port));
        assert!(!ports.contains(&40001) && !ports.contains(&40002));
    }

    fn trojan(id: ProfileId, mux: MuxState) -> Profile {
        let mut p = Profile::new(
            id,
            format!("t{id}"),
            ProxyBean::Trojan(TrojanBean {
                server: "t.example".into(),
                port: 443,
                password: "pw".into(),
                ..Default::default()
            }),
        );
        p.mux = mux;
        p
    }

    #[test]
    fn multiplex_follows_default_and_profile_switch() {
        let mut grpc = VmessBean {
            server: "v.example".into(),
            port: 443,
            uuid: "b831381d-6324-4d53-ad4f-8cda48b30811".into(),
            ..Default::default()
        };
        grpc.transport.network = "grpc".into();
        grpc.transport.service_name = "svc".into();
        let mut grpc = Profile::new(5, "grpc", ProxyBean::Vmess(grpc));
        grpc.mux = MuxState::On;
        let profiles = db(vec![
            trojan(1, MuxState::Default),
            trojan(2, MuxState::On),
            trojan(3, MuxState::Off),
            socks(4, "s.example"),
            grpc,
        ]);
        let routing = RoutingProfile::builtin_default(1);
        let mux_of = |settings: &GeneratorSettings, id: ProfileId| {
            ConfigGenerator::new(settings.clone())
                .generate(&profiles, &profiles[&id], &routing, None, run())
                .unwrap()
                .value()["outbounds"][0]
                .get("multiplex")
                .cloned()
        };

        let mut settings = GeneratorSettings::default();
        assert!(mux_of(&settings, 1).is_none());
        assert_eq!(
            mux_of(&settings, 2).unwrap(),
            json!({"enabled": true, "protocol": "h2mux", "max_streams": 8, "padding": false})
        );

        settings.mux.default_on = true;
        settings.mux.padding = true;
        assert_eq!(mux_of(&settings, 1).unwrap()["padding"], true);
        assert!(mux_of(&settings, 3).is_none());
        // socks 不支持，grpc 自带多路复用
        assert!(mux_of(&settings, 4).is_none());
        assert!(mux_of(&settings, 5).is_none());

        settings.mux.max_streams = 0;
        assert!(mux_of(&settings, 2).is_none());
    }

    #[test]
    fn ntp_only_in_run_documents() {
        let mut settings = GeneratorSettings::default();
        settings.ntp.enabled = true;
        let profiles = db(vec![socks(1, "a.example")]);
        let gen = ConfigGenerator::new(settings);
        let doc = gen
            .generate(&profiles, &profiles[&1], &RoutingProfile::builtin_default(1), None, run())
            .unwrap();
        assert_eq!(
            doc.value()["ntp"],
            json!({"enabled": true, "server": "time.apple.com", "server_port": 123, "interval": "30m"})
        );
        let test_doc = gen.generate_test(&profiles, &profiles[&1], 31000).unwrap();
        assert!(test_doc.value().get("ntp").is_none());

        let plain = ConfigGenerator::new(GeneratorSettings::default())
            .generate(&profiles, &profiles[&1], &RoutingProfile::builtin_default(1), None, run())
            .unwrap();
        assert!(plain.value().get("ntp").is_none());
    }

    #[test]
    fn source_rule_fields_reach_route() {
        let profiles = db(vec![socks(1, "a.example")]);
        let mut routing = RoutingProfile::new(1, "lan");
        routing.rules.push(RouteRule {
            source_ip_is_private: true,
            source_port_range: vec!["10000:".into()],
            process_path_regex: vec!["(?i)steam".into()],
            outbound: RuleOutbound::Direct,
            ..Default::default()
        });
        let gen = ConfigGenerator::new(GeneratorSettings::default());
        let doc = gen
            .generate(&profiles, &profiles[&1], &routing, None, run())
            .unwrap();
        let rules = doc.value()["route"]["rules"].as_array().unwrap();
        let rule = rules.last().unwrap();
        assert_eq!(rule["source_ip_is_private"], true);
        assert_eq!(rule["source_port_range"], json!(["10000:"]));
        assert_eq!(rule["process_path_regex"], json!(["(?i)steam"]));
        assert_eq!(rule["outbound"], "direct");
    }

    #[test]
    fn full_document_used_verbatim() {
        let full = json!({"outbounds": [{"type": "direct", "tag": "x"}], "inbounds": []});
        let mut p = Profile::new(
            1,
            "full",
            ProxyBean::Custom(CustomBean {
                mode: CustomMode::Full,
                config: full.clone(),
            }),
        );
        p.custom_config = Some(json!({"log": {"level": "error"}}));
        let gen = ConfigGenerator::new(GeneratorSettings::default());
        let doc = gen
            .generate(&db(vec![]), &p, &RoutingProfile::builtin_default(1), None, run())
            .unwrap();
        assert_eq!(doc.value()["outbounds"], full["outbounds"]);
        assert_eq!(doc.value()["log"]["level"], "error");
    }

    #[test]
    fn batch_skips_invalid_profiles() {
        let broken = Profile::new(2, "broken", ProxyBean::Socks(SocksBean::default()));
        let cyclic = Profile::new(3, "loop", ProxyBean::Chain(ChainBean { members: vec![3] }));
        let profiles = db(vec![socks(1, "a.example"), broken, cyclic, socks(4, "d.example")]);
        let list: Vec<&Profile> = profiles.values().collect();
        let gen = ConfigGenerator::new(GeneratorSettings::default());
        let batch = gen.generate_test_batch(&profiles, &list, 40000..);
        assert_eq!(batch.ports, BTreeMap::from([(1, 40000), (4, 40001)]));
        let skipped: Vec<_> = batch.skipped.iter().map(|(id, _)| *id).collect();
        assert_eq!(skipped, vec![2, 3]);
        let tags = outbound_tags(&batch.document);
        assert_eq!(tags, vec!["test-1", "test-4", "direct", "block", "dns-out"]);
        assert_eq!(batch.document.value()["route"]["final"], "block");
    }
}
