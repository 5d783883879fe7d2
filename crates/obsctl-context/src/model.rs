//! The context registry: APIs, their tenants and the current selection.
//!
//! `Registry` is the in-memory copy of the config file. All mutations go through
//! its methods so that the naming and current-selection invariants hold no matter
//! which caller is editing it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;
use url::Url;

use crate::error::{ContextError, NameKind, Result};

/// Separates the API and tenant halves of a context in its textual form.
pub const CONTEXT_SEPARATOR: char = '/';

/// How long before its expiry a cached token is treated as stale in memory.
const EXPIRY_DELTA_SECS: i64 = 10;

/// Root of the persisted registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default, deserialize_with = "null_as_default")]
    apis: BTreeMap<String, ApiEntry>,
    #[serde(default, with = "current_wire")]
    current: Option<ContextName>,
}

/// A registered remote API and the tenants known for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiEntry {
    /// Absolute base URL, always ending in `/`.
    pub url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub contexts: BTreeMap<String, TenantEntry>,
}

/// A tenant registered under an API. The map key is a local alias; `tenant` is
/// the identifier the remote API knows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantEntry {
    pub tenant: String,
    /// Raw CA certificate bytes, persisted as base64.
    #[serde(rename = "ca", default, with = "ca_bytes")]
    pub ca: Option<Vec<u8>>,
    #[serde(default)]
    pub oidc: Option<OidcSettings>,
}

/// OIDC client-credentials settings for a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcSettings {
    #[serde(default)]
    pub token: Option<Token>,
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub audience: Option<String>,
    #[serde(rename = "clientID", default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(rename = "issuerURL", default)]
    pub issuer_url: String,
    #[serde(default = "default_offline_access")]
    pub offline_access: bool,
}

/// A bearer token as persisted in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

/// An `(api, tenant)` pair, written `api/tenant` on the command line.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextName {
    pub api: String,
    pub tenant: String,
}

/// A context looked up in the registry, with copies of both entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedContext {
    pub name: ContextName,
    pub api: ApiEntry,
    pub tenant: TenantEntry,
}

impl Registry {
    pub fn apis(&self) -> &BTreeMap<String, ApiEntry> {
        &self.apis
    }

    pub fn api(&self, name: &str) -> Option<&ApiEntry> {
        self.apis.get(name)
    }

    pub fn current(&self) -> Option<&ContextName> {
        self.current.as_ref()
    }

    /// Register an API. An empty or missing name is derived from the URL host.
    /// Returns the name the API was stored under.
    pub fn add_api(&mut self, name: Option<&str>, url: &str) -> Result<String> {
        let parsed = parse_api_url(url)?;

        let name = match name.filter(|n| !n.is_empty()) {
            Some(name) => {
                validate_name(NameKind::Api, name)?;
                name.to_string()
            }
            None => {
                debug!("using URL host as api name");
                host_name(&parsed)
            }
        };

        if self.apis.contains_key(&name) {
            return Err(ContextError::DuplicateApi(name));
        }

        let mut url = String::from(parsed);
        if !url.ends_with('/') {
            url.push('/');
        }

        self.apis.insert(
            name.clone(),
            ApiEntry {
                url,
                contexts: BTreeMap::new(),
            },
        );
        Ok(name)
    }

    /// Remove an API and all of its tenants, clearing `current` if it pointed there.
    pub fn remove_api(&mut self, name: &str) -> Result<ApiEntry> {
        let removed = self
            .apis
            .remove(name)
            .ok_or_else(|| ContextError::ApiNotFound(name.to_string()))?;

        if self.current.as_ref().is_some_and(|c| c.api == name) {
            debug!(api = name, "removed api was current, emptying current context");
            self.current = None;
        }
        Ok(removed)
    }

    /// Add a tenant under `api`. The first tenant added to a registry without a
    /// current context becomes current. Returns true when that happened.
    pub fn add_tenant(&mut self, name: &str, api: &str, entry: TenantEntry) -> Result<bool> {
        let api_entry = self
            .apis
            .get_mut(api)
            .ok_or_else(|| ContextError::ApiNotFound(api.to_string()))?;

        validate_name(NameKind::Tenant, name)?;

        if api_entry.contexts.contains_key(name) {
            return Err(ContextError::DuplicateTenant {
                api: api.to_string(),
                tenant: name.to_string(),
            });
        }
        api_entry.contexts.insert(name.to_string(), entry);

        if self.current.is_none() {
            self.current = Some(ContextName::new(api, name));
            return Ok(true);
        }
        Ok(false)
    }

    /// Remove a tenant, clearing `current` if it was the selection.
    pub fn remove_tenant(&mut self, name: &str, api: &str) -> Result<TenantEntry> {
        let api_entry = self
            .apis
            .get_mut(api)
            .ok_or_else(|| ContextError::ApiNotFound(api.to_string()))?;

        let removed = api_entry
            .contexts
            .remove(name)
            .ok_or_else(|| ContextError::TenantNotFound {
                api: api.to_string(),
                tenant: name.to_string(),
            })?;

        if self
            .current
            .as_ref()
            .is_some_and(|c| c.api == api && c.tenant == name)
        {
            debug!(api, tenant = name, "removed tenant was current, emptying current context");
            self.current = None;
        }
        Ok(removed)
    }

    /// Remove `api/tenant`. When the tenant is the only one of its API, the API
    /// goes with it.
    pub fn remove_context(&mut self, api: &str, tenant: &str) -> Result<()> {
        let only_tenant = self
            .apis
            .get(api)
            .is_some_and(|a| a.contexts.len() == 1 && a.contexts.contains_key(tenant));

        if only_tenant {
            self.remove_api(api)?;
        } else {
            self.remove_tenant(tenant, api)?;
        }
        Ok(())
    }

    pub fn set_current(&mut self, api: &str, tenant: &str) -> Result<()> {
        self.resolve(api, tenant)?;

        let next = ContextName::new(api, tenant);
        if self.current.as_ref() == Some(&next) {
            debug!(context = %next, "context is the same as current");
        }
        self.current = Some(next);
        Ok(())
    }

    pub fn resolve(&self, api: &str, tenant: &str) -> Result<ResolvedContext> {
        let api_entry = self
            .apis
            .get(api)
            .ok_or_else(|| ContextError::ApiNotFound(api.to_string()))?;
        let tenant_entry =
            api_entry
                .contexts
                .get(tenant)
                .ok_or_else(|| ContextError::TenantNotFound {
                    api: api.to_string(),
                    tenant: tenant.to_string(),
                })?;

        Ok(ResolvedContext {
            name: ContextName::new(api, tenant),
            api: api_entry.clone(),
            tenant: tenant_entry.clone(),
        })
    }

    pub fn resolve_current(&self) -> Result<ResolvedContext> {
        let current = self.current.as_ref().ok_or(ContextError::EmptyContext)?;
        self.resolve(&current.api, &current.tenant)
    }

    /// Overwrite an existing tenant slot, e.g. after a token refresh.
    pub fn replace_tenant(&mut self, api: &str, tenant: &str, entry: TenantEntry) -> Result<()> {
        let slot = self
            .apis
            .get_mut(api)
            .ok_or_else(|| ContextError::ApiNotFound(api.to_string()))?
            .contexts
            .get_mut(tenant)
            .ok_or_else(|| ContextError::TenantNotFound {
                api: api.to_string(),
                tenant: tenant.to_string(),
            })?;
        *slot = entry;
        Ok(())
    }

    /// Every `api/tenant` pair, sorted.
    pub fn contexts(&self) -> Vec<ContextName> {
        self.apis
            .iter()
            .flat_map(|(api, entry)| {
                entry
                    .contexts
                    .keys()
                    .map(move |tenant| ContextName::new(api, tenant))
            })
            .collect()
    }
}

impl ApiEntry {
    /// The base URL, checked to be absolute.
    pub fn parsed_url(&self) -> Result<Url> {
        parse_api_url(&self.url)
    }
}

impl TenantEntry {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            ca: None,
            oidc: None,
        }
    }

    pub fn with_oidc(mut self, oidc: OidcSettings) -> Self {
        self.oidc = Some(oidc);
        self
    }

    pub fn with_ca(mut self, ca: Vec<u8>) -> Self {
        self.ca = Some(ca);
        self
    }
}

impl OidcSettings {
    pub fn new(
        issuer_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            token: None,
            audience: None,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            issuer_url: issuer_url.into(),
            offline_access: true,
        }
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        let audience = audience.into();
        self.audience = (!audience.is_empty()).then_some(audience);
        self
    }

    /// Scopes requested in the client-credentials grant.
    pub fn scopes(&self) -> Vec<&'static str> {
        if self.offline_access {
            vec!["openid", "offline_access"]
        } else {
            vec!["openid"]
        }
    }
}

impl Token {
    /// Whether a persisted token may be reused instead of fetching a new one.
    /// The expiry must be strictly after `now`; a token without an expiry is
    /// not reused.
    pub fn is_reusable_at(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.is_empty() && self.expiry.is_some_and(|expiry| expiry > now)
    }

    /// Whether an in-memory token should be replaced before the next request.
    pub fn needs_refresh_at(&self, now: DateTime<Utc>) -> bool {
        if self.access_token.is_empty() {
            return true;
        }
        match self.expiry {
            Some(expiry) => expiry - Duration::seconds(EXPIRY_DELTA_SECS) < now,
            None => false,
        }
    }

    /// Value for the `Authorization` header.
    pub fn authorization_value(&self) -> String {
        let kind = match self.token_type.to_ascii_lowercase().as_str() {
            "" | "bearer" => "Bearer",
            "mac" => "MAC",
            "basic" => "Basic",
            _ => self.token_type.as_str(),
        };
        format!("{} {}", kind, self.access_token)
    }
}

impl ContextName {
    pub fn new(api: impl Into<String>, tenant: impl Into<String>) -> Self {
        Self {
            api: api.into(),
            tenant: tenant.into(),
        }
    }
}

impl fmt::Display for ContextName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.api, CONTEXT_SEPARATOR, self.tenant)
    }
}

impl FromStr for ContextName {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason| ContextError::InvalidName {
            kind: NameKind::Api,
            name: s.to_string(),
            reason,
        };

        let (api, tenant) = s
            .split_once(CONTEXT_SEPARATOR)
            .ok_or_else(|| invalid("use format <api>/<tenant>"))?;
        if api.is_empty() || tenant.is_empty() || tenant.contains(CONTEXT_SEPARATOR) {
            return Err(invalid("use format <api>/<tenant>"));
        }
        Ok(ContextName::new(api, tenant))
    }
}

fn validate_name(kind: NameKind, name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "must not be empty"
    } else if name.contains(CONTEXT_SEPARATOR) {
        "cannot contain slashes"
    } else {
        return Ok(());
    };
    Err(ContextError::InvalidName {
        kind,
        name: name.to_string(),
        reason,
    })
}

/// Parse a URL and require both a scheme and a host.
fn parse_api_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| ContextError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(url),
        _ => Err(ContextError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("missing host (scheme: {})", url.scheme()),
        }),
    }
}

/// `host[:port]`, the name an API gets when none is given.
fn host_name(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

fn default_offline_access() -> bool {
    true
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.filter(|s| !s.is_empty()))
}

/// `current` is always written as `{"api": ..., "tenant": ...}`; empty strings
/// mean no selection.
mod current_wire {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::ContextName;

    #[derive(Default, Serialize, Deserialize)]
    struct Wire {
        #[serde(default)]
        api: String,
        #[serde(default)]
        tenant: String,
    }

    pub fn serialize<S: Serializer>(
        current: &Option<ContextName>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let wire = match current {
            Some(c) => Wire {
                api: c.api.clone(),
                tenant: c.tenant.clone(),
            },
            None => Wire::default(),
        };
        wire.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<ContextName>, D::Error> {
        let wire = Option::<Wire>::deserialize(deserializer)?.unwrap_or_default();
        if wire.api.is_empty() || wire.tenant.is_empty() {
            return Ok(None);
        }
        Ok(Some(ContextName::new(wire.api, wire.tenant)))
    }
}

mod ca_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ca: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match ca {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| STANDARD.decode(encoded).map_err(D::Error::custom))
            .transpose()
    }
}
