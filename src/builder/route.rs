use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{json, Value};

use crate::model::{ProfileId, RoutingProfile, RuleOutbound};

/// 翻译路由规则；引用 profile 的规则使用生成器分配的 `rout-N` tag
pub(crate) fn build_rules(
    routing: &RoutingProfile,
    profile_tags: &BTreeMap<ProfileId, String>,
) -> Vec<Value> {
    routing
        .rules
        .iter()
        .filter_map(|rule| {
            let tag = match rule.outbound {
                RuleOutbound::Profile(id) => profile_tags.get(&id)?.as_str(),
                builtin => builtin.builtin_tag()?,
            };
            Some(rule.to_json(tag))
        })
        .collect()
}

/// 规则集都指向本地的二进制 `.srs` 文件
pub(crate) fn rule_set_entries(routing: &RoutingProfile, dir: &Path) -> Vec<Value> {
    routing
        .used_rule_sets()
        .into_iter()
        .map(|name| {
            let path = dir.join(format!("{name}.srs"));
            json!({
                "type": "local",
                "tag": name,
                "format": "binary",
                "path": path.to_string_lossy(),
            })
        })
        .collect()
}
