//! Rows read from the relational system of record.
use super::entity::Entity;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: u64,
    pub tenant_id: u64,
    pub name: String,
}

/// Environment row joined with its cluster name; `cluster` is `None` when the
/// environment is not bound to a cluster yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub id: u64,
    pub project_id: u64,
    pub name: String,
    pub cluster: Option<String>,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualSpaceRecord {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub username: String,
    pub system_role: String,
}

/// One membership row joined with the resource name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub resource_id: u64,
    pub resource_name: String,
    pub role: String,
}

impl From<&TenantRecord> for Entity {
    fn from(record: &TenantRecord) -> Self {
        Entity::tenant(record.id, record.name.clone())
    }
}

impl From<&ProjectRecord> for Entity {
    fn from(record: &ProjectRecord) -> Self {
        Entity::project(record.tenant_id, record.id, record.name.clone())
    }
}

impl From<&VirtualSpaceRecord> for Entity {
    fn from(record: &VirtualSpaceRecord) -> Self {
        Entity::virtual_space(record.id, record.name.clone())
    }
}

impl EnvironmentRecord {
    /// Cache entity for this environment; `None` until it has a cluster.
    pub fn to_entity(&self) -> Option<Entity> {
        let cluster = self.cluster.as_ref()?;
        Some(Entity::environment(
            self.project_id,
            self.id,
            self.name.clone(),
            cluster.clone(),
            self.namespace.clone(),
        ))
    }
}

/// A full dump of the topology tables, used to populate an empty cache.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub tenants: Vec<TenantRecord>,
    pub projects: Vec<ProjectRecord>,
    pub environments: Vec<EnvironmentRecord>,
    pub virtual_spaces: Vec<VirtualSpaceRecord>,
}

impl Topology {
    /// Entities with `children` filled from the owner references.
    pub fn entities(&self) -> Vec<Entity> {
        let mut entities: Vec<Entity> = Vec::new();
        entities.extend(self.tenants.iter().map(Entity::from));
        entities.extend(self.projects.iter().map(Entity::from));
        for env in &self.environments {
            match env.to_entity() {
                Some(entity) => entities.push(entity),
                None => tracing::warn!(
                    environment_id = env.id,
                    environment = %env.name,
                    "environment has no cluster; not cached"
                ),
            }
        }
        entities.extend(self.virtual_spaces.iter().map(Entity::from));
        link_children(&mut entities);
        entities
    }
}

/// Fill every entity's `children` from the others' owner references.
pub fn link_children(entities: &mut [Entity]) {
    let edges: Vec<_> = entities
        .iter()
        .flat_map(|entity| {
            entity
                .owner
                .iter()
                .map(move |owner| (*owner, entity.resource_ref()))
        })
        .collect();
    for (owner, child) in edges {
        if let Some(parent) = entities
            .iter_mut()
            .find(|candidate| candidate.resource_ref() == owner)
        {
            parent.add_child(child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Kind, ResourceRef};

    fn topology() -> Topology {
        Topology {
            tenants: vec![TenantRecord {
                id: 1,
                name: "t1".into(),
            }],
            projects: vec![ProjectRecord {
                id: 5,
                tenant_id: 1,
                name: "p5".into(),
            }],
            environments: vec![
                EnvironmentRecord {
                    id: 10,
                    project_id: 5,
                    name: "e10".into(),
                    cluster: Some("c1".into()),
                    namespace: "ns-dev".into(),
                },
                EnvironmentRecord {
                    id: 11,
                    project_id: 5,
                    name: "e11".into(),
                    cluster: None,
                    namespace: "ns-unbound".into(),
                },
            ],
            virtual_spaces: vec![VirtualSpaceRecord {
                id: 3,
                name: "vs".into(),
            }],
        }
    }

    #[test]
    fn entities_link_children_and_skip_unbound_environments() {
        let entities = topology().entities();
        assert_eq!(entities.len(), 4);
        let tenant = entities.iter().find(|e| e.kind == Kind::Tenant).unwrap();
        assert_eq!(tenant.children, vec![ResourceRef::new(Kind::Project, 5)]);
        let project = entities.iter().find(|e| e.kind == Kind::Project).unwrap();
        assert_eq!(
            project.children,
            vec![ResourceRef::new(Kind::Environment, 10)]
        );
        assert!(!entities.iter().any(|e| e.id == 11));
    }
}
