//! Builds a user's flattened role snapshot from the system of record.
use crate::model::{Kind, User, UserAuthority, UserResource};
use crate::store::RecordStore;
use std::sync::Arc;

/// Result of one rebuild. `degraded` is set when any membership query failed;
/// the affected scope is left empty so the caller is denied by omission.
#[derive(Debug, Clone)]
pub struct ResolvedAuthority {
    pub authority: UserAuthority,
    pub degraded: bool,
}

#[derive(Clone)]
pub struct AuthorityResolver {
    records: Arc<dyn RecordStore>,
}

impl AuthorityResolver {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub async fn resolve(&self, user: &User, backend: &'static str) -> ResolvedAuthority {
        metrics::counter!("authority_rebuilds_total", "backend" => backend).increment(1);
        let mut authority = UserAuthority {
            system_role: user.system_role.clone(),
            ..UserAuthority::default()
        };
        let mut degraded = false;
        for kind in Kind::ALL {
            match self.records.user_memberships(user.id, kind).await {
                Ok(rows) => {
                    *authority.resources_mut(kind) = rows
                        .into_iter()
                        .map(|row| UserResource::new(kind, row.resource_id, row.resource_name, row.role))
                        .collect();
                }
                Err(err) => {
                    degraded = true;
                    tracing::error!(
                        username = %user.username,
                        kind = %kind,
                        error = %err,
                        "membership query failed; authority degraded"
                    );
                }
            }
        }
        ResolvedAuthority {
            authority,
            degraded,
        }
    }
}
