use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{JsonFile, RegistryError, SnapshotCell, StoreError};
use crate::model::{
    Group, GroupId, GroupKind, Profile, ProfileId, ProfileOrigin, ProxyBean, TestResult,
};

/// 某一时刻的全部 Profile 与 Group
#[derive(Debug, Clone, Default)]
pub struct ProfileData {
    profiles: BTreeMap<ProfileId, Profile>,
    groups: BTreeMap<GroupId, Group>,
    next_profile_id: ProfileId,
    next_group_id: GroupId,
}

/// 磁盘格式：按 id 有序的实体列表
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedProfiles {
    #[serde(default)]
    groups: Vec<Group>,
    #[serde(default)]
    profiles: Vec<Profile>,
}

impl ProfileData {
    fn from_persisted(p: PersistedProfiles) -> Self {
        let mut profiles: BTreeMap<_, _> = p.profiles.into_iter().map(|x| (x.id, x)).collect();
        let mut groups: BTreeMap<_, _> = p.groups.into_iter().map(|g| (g.id, g)).collect();

        // 以组的成员列表为准重建 profile.group，丢掉悬空引用
        for profile in profiles.values_mut() {
            profile.group = None;
        }
        for group in groups.values_mut() {
            let gid = group.id;
            let mut seen = std::collections::BTreeSet::new();
            group.members.retain(|id| {
                let keep = seen.insert(*id)
                    && profiles.get(id).map_or(false, |p| p.group.is_none());
                if keep {
                    if let Some(p) = profiles.get_mut(id) {
                        p.group = Some(gid);
                    }
                }
                keep
            });
        }

        let next_profile_id = profiles.keys().next_back().map_or(1, |id| id + 1);
        let next_group_id = groups.keys().next_back().map_or(1, |id| id + 1);
        Self {
            profiles,
            groups,
            next_profile_id,
            next_group_id,
        }
    }

    fn to_persisted(&self) -> PersistedProfiles {
        PersistedProfiles {
            groups: self.groups.values().cloned().collect(),
            profiles: self.profiles.values().cloned().collect(),
        }
    }

    pub fn profile(&self, id: ProfileId) -> Option<&Profile> {
        self.profiles.get(&id)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &Profile> {
        self.profiles.values()
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// 组成员，按组内顺序
    pub fn members(&self, group: GroupId) -> Vec<&Profile> {
        self.groups
            .get(&group)
            .map(|g| g.members.iter().filter_map(|id| self.profiles.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn group_of(&self, profile: &Profile) -> Option<&Group> {
        profile.group.and_then(|g| self.groups.get(&g))
    }

    pub fn profile_mut(&mut self, id: ProfileId) -> Result<&mut Profile, RegistryError> {
        self.profiles
            .get_mut(&id)
            .ok_or_else(|| RegistryError::not_found(format!("profile #{id}")))
    }

    pub fn group_mut(&mut self, id: GroupId) -> Result<&mut Group, RegistryError> {
        self.groups
            .get_mut(&id)
            .ok_or_else(|| RegistryError::not_found(format!("group #{id}")))
    }

    pub fn insert_group(&mut self, name: impl Into<String>, kind: GroupKind) -> GroupId {
        let id = self.next_group_id.max(1);
        self.next_group_id = id + 1;
        self.groups.insert(id, Group::new(id, name, kind));
        id
    }

    /// 删除组及其全部成员
    pub fn remove_group(&mut self, id: GroupId) -> Result<Group, RegistryError> {
        let group = self
            .groups
            .remove(&id)
            .ok_or_else(|| RegistryError::not_found(format!("group #{id}")))?;
        for member in &group.members {
            self.profiles.remove(member);
        }
        Ok(group)
    }

    pub fn insert_profile(
        &mut self,
        group: Option<GroupId>,
        name: impl Into<String>,
        bean: ProxyBean,
        origin: ProfileOrigin,
    ) -> Result<ProfileId, RegistryError> {
        if let Some(gid) = group {
            let g = self
                .groups
                .get(&gid)
                .ok_or_else(|| RegistryError::not_found(format!("group #{gid}")))?;
            check_membership(g, origin)?;
        }
        let id = self.next_profile_id.max(1);
        self.next_profile_id = id + 1;
        let mut profile = Profile::new(id, name, bean);
        profile.origin = origin;
        profile.group = group;
        self.profiles.insert(id, profile);
        if let Some(gid) = group {
            self.group_mut(gid)?.members.push(id);
        }
        Ok(id)
    }

    pub fn remove_profile(&mut self, id: ProfileId) -> Result<Profile, RegistryError> {
        let profile = self
            .profiles
            .remove(&id)
            .ok_or_else(|| RegistryError::not_found(format!("profile #{id}")))?;
        if let Some(g) = profile.group.and_then(|g| self.groups.get_mut(&g)) {
            g.members.retain(|m| *m != id);
        }
        Ok(profile)
    }

    /// 移动到另一个组（或移出所有组）。订阅来源的 profile 移出后视为手动
    pub fn move_profile(
        &mut self,
        id: ProfileId,
        to: Option<GroupId>,
    ) -> Result<(), RegistryError> {
        let current = self.profile_mut(id)?.group;
        if current == to {
            return Ok(());
        }
        let origin = if current.is_some() {
            ProfileOrigin::Manual
        } else {
            self.profile_mut(id)?.origin
        };
        if let Some(gid) = to {
            let g = self
                .groups
                .get(&gid)
                .ok_or_else(|| RegistryError::not_found(format!("group #{gid}")))?;
            check_membership(g, origin)?;
        }
        if let Some(g) = current.and_then(|g| self.groups.get_mut(&g)) {
            g.members.retain(|m| *m != id);
        }
        if let Some(gid) = to {
            self.group_mut(gid)?.members.push(id);
        }
        let profile = self.profile_mut(id)?;
        profile.group = to;
        profile.origin = origin;
        Ok(())
    }

    /// 脱离订阅管理：留在组内，但同步不再改动它
    pub fn detach_profile(&mut self, id: ProfileId) -> Result<(), RegistryError> {
        self.profile_mut(id)?.origin = ProfileOrigin::Manual;
        Ok(())
    }
}

fn check_membership(group: &Group, origin: ProfileOrigin) -> Result<(), RegistryError> {
    match (group.kind, origin) {
        (GroupKind::Subscription, ProfileOrigin::Manual) => Err(RegistryError::rejected(
            group.label(),
            "manually created profiles cannot join a subscription group",
        )),
        _ => Ok(()),
    }
}

pub struct ProfileRegistry {
    cell: SnapshotCell<ProfileData>,
    file: Option<JsonFile>,
}

impl ProfileRegistry {
    /// 不落盘，测试与一次性命令使用
    pub fn in_memory() -> Self {
        Self {
            cell: SnapshotCell::new(ProfileData::default()),
            file: None,
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let file = JsonFile::new(path);
        let data = file
            .load::<PersistedProfiles>()?
            .map(ProfileData::from_persisted)
            .unwrap_or_default();
        tracing::debug!(
            path = %file.path().display(),
            profiles = data.profiles.len(),
            groups = data.groups.len(),
            "profile registry loaded"
        );
        Ok(Self {
            cell: SnapshotCell::new(data),
            file: Some(file),
        })
    }

    pub fn snapshot(&self) -> Arc<ProfileData> {
        self.cell.load()
    }

    /// 单写者更新：闭包失败或落盘失败时什么都不发布
    pub fn update<R, E>(
        &self,
        f: impl FnOnce(&mut ProfileData) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        self.cell.update(f, |data| match &self.file {
            Some(file) => file.save(&data.to_persisted()).map_err(E::from),
            None => Ok(()),
        })
    }

    pub fn add_group(&self, name: &str, kind: GroupKind) -> Result<GroupId, RegistryError> {
        self.update(|d| Ok(d.insert_group(name, kind)))
    }

    pub fn add_profile(
        &self,
        group: Option<GroupId>,
        name: &str,
        bean: ProxyBean,
    ) -> Result<ProfileId, RegistryError> {
        self.update(|d| d.insert_profile(group, name, bean, ProfileOrigin::Manual))
    }

    /// 多字段编辑整体生效
    pub fn edit_profile(
        &self,
        id: ProfileId,
        edit: impl FnOnce(&mut Profile),
    ) -> Result<(), RegistryError> {
        self.update(|d| {
            edit(d.profile_mut(id)?);
            Ok(())
        })
    }

    pub fn edit_group(
        &self,
        id: GroupId,
        edit: impl FnOnce(&mut Group),
    ) -> Result<(), RegistryError> {
        self.update(|d| {
            edit(d.group_mut(id)?);
            Ok(())
        })
    }

    pub fn delete_profile(&self, id: ProfileId) -> Result<Profile, RegistryError> {
        self.update(|d| d.remove_profile(id))
    }

    /// 已被删除的 profile 的结果直接丢弃
    /// 一批测速结果一次提交、一次落盘；返回写入的条数，已删除的 profile 跳过
    pub fn record_test_results(&self, results: &[TestResult]) -> Result<usize, RegistryError> {
        if results.is_empty() {
            return Ok(0);
        }
        self.update(|d| {
            let mut written = 0;
            for result in results {
                if let Some(p) = d.profiles.get_mut(&result.profile_id) {
                    p.last_test = Some(result.clone());
                    written += 1;
                }
            }
            Ok(written)
        })
    }
}
