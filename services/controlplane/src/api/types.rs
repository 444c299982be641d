//! Request and response bodies for the HTTP surface.
use crate::model::{Entity, Kind, UserAuthority};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub request_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub records_backend: String,
    pub cache_backend: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EntityList {
    pub items: Vec<Entity>,
}

/// Lightweight listing row for `_all` queries answered from the system of record.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResourceSummary {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResourceSummaryList {
    pub items: Vec<ResourceSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthorityResponse {
    pub username: String,
    pub system_admin: bool,
    pub authority: UserAuthority,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResourceCheckRequest {
    pub kind: Kind,
    pub id: u64,
    /// HTTP method the caller intends to use; defaults to `GET`.
    #[serde(default)]
    pub method: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NamespaceCheckRequest {
    pub cluster: String,
    pub namespace: String,
    #[serde(default)]
    pub method: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TenantUpsertRequest {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProjectUpsertRequest {
    pub tenant_id: u64,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnvironmentUpsertRequest {
    pub project_id: u64,
    pub name: String,
    pub cluster: String,
    pub namespace: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VirtualSpaceUpsertRequest {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WriteResult {
    pub changed: bool,
}
