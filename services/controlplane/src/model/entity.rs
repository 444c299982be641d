//! Cached topology nodes and their cache keys.
//!
//! # Purpose
//! Defines the closed set of scope kinds, weak owner/child references, and the
//! `Entity` record stored by every cache backend.
//!
//! # Key invariants
//! - Containment is strictly ordered by kind (tenant → project → environment),
//!   so the ownership graph is an acyclic forest of depth ≤ 3.
//! - Owners and children are weak `(kind, id)` references; the referenced
//!   record is always looked up by key.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Scope kinds tracked by the resource tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Kind {
    Tenant,
    Project,
    Environment,
    VirtualSpace,
}

impl Kind {
    pub const ALL: [Kind; 4] = [
        Kind::Tenant,
        Kind::Project,
        Kind::Environment,
        Kind::VirtualSpace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Tenant => "tenant",
            Kind::Project => "project",
            Kind::Environment => "environment",
            Kind::VirtualSpace => "virtualSpace",
        }
    }

    /// Kind of the immediate container, if this kind is nested.
    pub fn owner_kind(&self) -> Option<Kind> {
        match self {
            Kind::Project => Some(Kind::Tenant),
            Kind::Environment => Some(Kind::Project),
            Kind::Tenant | Kind::VirtualSpace => None,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown resource kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for Kind {
    type Err = UnknownKind;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "tenant" => Ok(Kind::Tenant),
            "project" => Ok(Kind::Project),
            "environment" => Ok(Kind::Environment),
            "virtualSpace" | "virtualspace" => Ok(Kind::VirtualSpace),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

/// Weak `(kind, id)` reference to another entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: Kind,
    pub id: u64,
}

impl ResourceRef {
    pub fn new(kind: Kind, id: u64) -> Self {
        Self { kind, id }
    }

    pub fn cache_key(&self) -> String {
        cache_key(self.kind, self.id)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Primary key of an entity: `{kind}_{id}`.
pub fn cache_key(kind: Kind, id: u64) -> String {
    format!("{kind}_{id}")
}

/// Secondary key of an environment: `{cluster}_{namespace}`.
pub fn environment_key(cluster: &str, namespace: &str) -> String {
    format!("{cluster}_{namespace}")
}

/// One node of the containment graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub kind: Kind,
    pub id: u64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub owner: Vec<ResourceRef>,
    /// Direct children, kept in sync by upsert/delete.
    #[serde(default)]
    pub children: Vec<ResourceRef>,
}

impl Entity {
    pub fn tenant(id: u64, name: impl Into<String>) -> Self {
        Self::root(Kind::Tenant, id, name)
    }

    pub fn virtual_space(id: u64, name: impl Into<String>) -> Self {
        Self::root(Kind::VirtualSpace, id, name)
    }

    pub fn project(tenant_id: u64, id: u64, name: impl Into<String>) -> Self {
        Self {
            owner: vec![ResourceRef::new(Kind::Tenant, tenant_id)],
            ..Self::root(Kind::Project, id, name)
        }
    }

    pub fn environment(
        project_id: u64,
        id: u64,
        name: impl Into<String>,
        cluster: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            cluster: Some(cluster.into()),
            namespace: Some(namespace.into()),
            owner: vec![ResourceRef::new(Kind::Project, project_id)],
            ..Self::root(Kind::Environment, id, name)
        }
    }

    fn root(kind: Kind, id: u64, name: impl Into<String>) -> Self {
        Self {
            kind,
            id,
            name: name.into(),
            cluster: None,
            namespace: None,
            owner: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef::new(self.kind, self.id)
    }

    pub fn cache_key(&self) -> String {
        cache_key(self.kind, self.id)
    }

    /// Secondary index key; only environments bound to a cluster have one.
    pub fn environment_key(&self) -> Option<String> {
        match (self.kind, &self.cluster, &self.namespace) {
            (Kind::Environment, Some(cluster), Some(namespace)) => {
                Some(environment_key(cluster, namespace))
            }
            _ => None,
        }
    }

    /// Compare everything except the denormalized child list.
    pub fn same_shape(&self, other: &Entity) -> bool {
        self.kind == other.kind
            && self.id == other.id
            && self.name == other.name
            && self.cluster == other.cluster
            && self.namespace == other.namespace
            && self.owner == other.owner
    }

    /// Returns `true` when the child was not already present.
    pub fn add_child(&mut self, child: ResourceRef) -> bool {
        if self.children.contains(&child) {
            return false;
        }
        self.children.push(child);
        true
    }

    /// Returns `true` when the child was present.
    pub fn remove_child(&mut self, child: &ResourceRef) -> bool {
        let before = self.children.len();
        self.children.retain(|existing| existing != child);
        before != self.children.len()
    }
}
