//! Authorization decisions for HTTP gates and audit tagging.
use crate::cache::CacheError;
use thiserror::Error;

pub mod checker;

pub use checker::{Action, Decision, PermissionChecker, cascade};

#[derive(Debug, Error)]
pub enum AuthzError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("environment data is abnormal: environment {0} has no cached ancestry")]
    AbnormalEnvironment(u64),
}

pub type AuthzResult<T> = Result<T, AuthzError>;
