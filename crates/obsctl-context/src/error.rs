use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Which half of a context a name belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    Api,
    Tenant,
}

impl fmt::Display for NameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameKind::Api => write!(f, "api"),
            NameKind::Tenant => write!(f, "tenant"),
        }
    }
}

/// Errors returned by the context store and the credential provider.
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("{kind} name {name:?} is invalid: {reason}")]
    InvalidName {
        kind: NameKind,
        name: String,
        reason: &'static str,
    },

    #[error("{url} is not a valid URL: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("api with name {0} already exists")]
    DuplicateApi(String),

    #[error("tenant with name {tenant} already exists in api {api}")]
    DuplicateTenant { api: String, tenant: String },

    #[error("api with name {0} doesn't exist")]
    ApiNotFound(String),

    #[error("tenant with name {tenant} doesn't exist in api {api}")]
    TenantNotFound { api: String, tenant: String },

    #[error("current context is empty")]
    EmptyContext,

    #[error("parsing config file {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("constructing oidc provider for {issuer}: {reason}")]
    ProviderDiscovery { issuer: String, reason: String },

    #[error("fetching token: {0}")]
    TokenFetch(String),

    #[error("config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl ContextError {
    /// True for both the missing-API and missing-tenant cases.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ContextError::ApiNotFound(_) | ContextError::TenantNotFound { .. }
        )
    }

    /// True for both the duplicate-API and duplicate-tenant cases.
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            ContextError::DuplicateApi(_) | ContextError::DuplicateTenant { .. }
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ContextError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ContextError>;
