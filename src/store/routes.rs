use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{JsonFile, RegistryError, SnapshotCell, StoreError};
use crate::model::{RouteId, RoutingProfile};

/// 路由配置集合。单个 RoutingProfile 以 `Arc` 持有，
/// 运行中的 core 拿到的快照不会被后续编辑影响。
#[derive(Debug, Clone)]
pub struct RouteData {
    routes: BTreeMap<RouteId, Arc<RoutingProfile>>,
    active: RouteId,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedRoutes {
    active: RouteId,
    #[serde(default)]
    routes: Vec<RoutingProfile>,
}

impl Default for RouteData {
    fn default() -> Self {
        let default = RoutingProfile::builtin_default(1);
        let mut routes = BTreeMap::new();
        routes.insert(default.id, Arc::new(default));
        Self { routes, active: 1 }
    }
}

impl RouteData {
    fn from_persisted(p: PersistedRoutes) -> Self {
        if p.routes.is_empty() {
            return Self::default();
        }
        let routes: BTreeMap<_, _> = p.routes.into_iter().map(|r| (r.id, Arc::new(r))).collect();
        let active = if routes.contains_key(&p.active) {
            p.active
        } else {
            *routes.keys().next().unwrap_or(&1)
        };
        Self { routes, active }
    }

    fn to_persisted(&self) -> PersistedRoutes {
        PersistedRoutes {
            active: self.active,
            routes: self.routes.values().map(|r| (**r).clone()).collect(),
        }
    }

    pub fn get(&self, id: RouteId) -> Option<Arc<RoutingProfile>> {
        self.routes.get(&id).cloned()
    }

    pub fn routes(&self) -> impl Iterator<Item = &Arc<RoutingProfile>> {
        self.routes.values()
    }

    pub fn active_id(&self) -> RouteId {
        self.active
    }

    pub fn active(&self) -> Arc<RoutingProfile> {
        self.routes
            .get(&self.active)
            .cloned()
            .unwrap_or_else(|| Arc::new(RoutingProfile::builtin_default(self.active)))
    }

    /// 新建时分配 id；已存在则整体替换
    pub fn upsert(&mut self, mut route: RoutingProfile) -> RouteId {
        if route.id == 0 {
            route.id = self.routes.keys().next_back().map_or(1, |id| id + 1);
        }
        let id = route.id;
        self.routes.insert(id, Arc::new(route));
        id
    }

    pub fn remove(&mut self, id: RouteId) -> Result<(), RegistryError> {
        if id == self.active {
            return Err(RegistryError::rejected(
                format!("route #{id}"),
                "cannot remove the active routing profile",
            ));
        }
        self.routes
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| RegistryError::not_found(format!("route #{id}")))
    }

    pub fn set_active(&mut self, id: RouteId) -> Result<(), RegistryError> {
        if !self.routes.contains_key(&id) {
            return Err(RegistryError::not_found(format!("route #{id}")));
        }
        self.active = id;
        Ok(())
    }
}

pub struct RouteRegistry {
    cell: SnapshotCell<RouteData>,
    file: Option<JsonFile>,
}

impl RouteRegistry {
    pub fn in_memory() -> Self {
        Self {
            cell: SnapshotCell::new(RouteData::default()),
            file: None,
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let file = JsonFile::new(path);
        let data = file
            .load::<PersistedRoutes>()?
            .map(RouteData::from_persisted)
            .unwrap_or_default();
        Ok(Self {
            cell: SnapshotCell::new(data),
            file: Some(file),
        })
    }

    pub fn snapshot(&self) -> Arc<RouteData> {
        self.cell.load()
    }

    pub fn active(&self) -> Arc<RoutingProfile> {
        self.snapshot().active()
    }

    pub fn get(&self, id: RouteId) -> Option<Arc<RoutingProfile>> {
        self.snapshot().get(id)
    }

    pub fn update<R, E>(&self, f: impl FnOnce(&mut RouteData) -> Result<R, E>) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        self.cell.update(f, |data| match &self.file {
            Some(file) => file.save(&data.to_persisted()).map_err(E::from),
            None => Ok(()),
        })
    }

    pub fn upsert(&self, route: RoutingProfile) -> Result<RouteId, RegistryError> {
        self.update(|d| Ok(d.upsert(route)))
    }

    pub fn set_active(&self, id: RouteId) -> Result<(), RegistryError> {
        self.update(|d| d.set_active(id))
    }
}
