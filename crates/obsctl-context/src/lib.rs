//! Context registry and credentials for obsctl.
//!
//! This crate owns everything that has to survive between two CLI invocations:
//! - `codec`: reading and writing the registry file
//! - `ContextStore`: API/tenant CRUD and the current selection
//! - `CredentialProvider`: OIDC client-credentials tokens bound to an HTTP client
//!
//! Every store operation is load -> mutate -> save; nothing is held open.

pub mod codec;
mod credentials;
mod error;
mod model;
mod store;

pub use credentials::{
    ApiClient, BoundContext, ClientCredentialsSource, CredentialProvider, ProviderMetadata,
    ReuseTokenSource, SharedTokenSource, TokenSource,
};
pub use error::{ContextError, NameKind, Result};
pub use model::{
    ApiEntry, ContextName, OidcSettings, Registry, ResolvedContext, TenantEntry, Token,
};
pub use store::ContextStore;
