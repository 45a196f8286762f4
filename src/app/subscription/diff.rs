//! 订阅差异计算
//!
//! 纯函数，只看组当前成员和新解析出的候选，按身份键配对。
//! 手动创建（或已脱离订阅）的成员不参与比较。

use std::collections::{HashMap, HashSet};

use crate::config::subscription::Candidate;
use crate::model::{IdentityKey, Profile, ProfileId, ProfileOrigin, SubscriptionSource};

#[derive(Debug, Default, PartialEq)]
pub struct SyncPlan {
    pub add: Vec<Candidate>,
    /// 配对成功且字段有变化的成员
    pub update: Vec<(ProfileId, Candidate)>,
    pub remove: Vec<ProfileId>,
    /// 远端已不存在、按组选项保留的成员
    pub mark_stale: Vec<ProfileId>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty()
            && self.update.is_empty()
            && self.remove.is_empty()
            && self.mark_stale.is_empty()
    }
}

pub fn plan(members: &[&Profile], candidates: &[Candidate], source: &SubscriptionSource) -> SyncPlan {
    let mut by_key: HashMap<IdentityKey, &Profile> = HashMap::new();
    for member in members.iter().filter(|m| m.origin == ProfileOrigin::Subscription) {
        by_key.entry(member.identity_key()).or_insert(*member);
    }

    let mut plan = SyncPlan::default();
    let mut matched = HashSet::new();
    for candidate in candidates {
        match by_key.get(&candidate.identity()) {
            Some(member) => {
                if !matched.insert(member.id) {
                    continue;
                }
                if member.name != candidate.name || member.bean != candidate.bean || member.stale {
                    plan.update.push((member.id, candidate.clone()));
                }
            }
            None => plan.add.push(candidate.clone()),
        }
    }

    let drop_missing = source.clear_before_update || !source.never_clear;
    // 保持组内顺序
    for member in members {
        if member.origin != ProfileOrigin::Subscription || matched.contains(&member.id) {
            continue;
        }
        if drop_missing {
            plan.remove.push(member.id);
        } else if !member.stale {
            plan.mark_stale.push(member.id);
        }
    }
    plan
}
