//! OIDC client-credentials tokens and the HTTP clients that carry them.
//!
//! A tenant with OIDC settings gets an [`ApiClient`] whose token source first
//! reuses the token cached in the registry (when it has not expired) and
//! otherwise runs the client-credentials grant against the provider's token
//! endpoint. The token is refreshed lazily, per request, once it gets close to
//! its expiry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, instrument, Instrument, Span};

use crate::error::{ContextError, Result};
use crate::model::{OidcSettings, ResolvedContext, TenantEntry, Token};
use crate::store::ContextStore;

const DISCOVERY_PATH: &str = ".well-known/openid-configuration";

/// Timeout for every outbound request unless the caller picks another one.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Anything that can hand out a bearer token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<Token>;
}

/// Token source shared between clones of a client.
pub type SharedTokenSource = Arc<dyn TokenSource>;

/// The parts of an OpenID provider configuration we rely on.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub token_endpoint: String,
}

impl ProviderMetadata {
    /// Fetch `<issuer>/.well-known/openid-configuration`.
    #[instrument(skip(http), level = "debug")]
    pub async fn discover(http: &Client, issuer_url: &str) -> Result<Self> {
        let discovery_failed = |reason: String| ContextError::ProviderDiscovery {
            issuer: issuer_url.to_string(),
            reason,
        };

        let url = format!("{}/{}", issuer_url.trim_end_matches('/'), DISCOVERY_PATH);
        debug!("Fetching OIDC discovery document: {}", url);

        let response = http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| discovery_failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(discovery_failed(format!("discovery returned {}", status)));
        }

        let metadata: ProviderMetadata = response
            .json()
            .await
            .map_err(|e| discovery_failed(format!("invalid discovery document: {}", e)))?;

        if metadata.issuer.trim_end_matches('/') != issuer_url.trim_end_matches('/') {
            return Err(discovery_failed(format!(
                "issuer did not match the issuer returned by provider, expected {:?} got {:?}",
                issuer_url, metadata.issuer
            )));
        }
        if metadata.token_endpoint.is_empty() {
            return Err(discovery_failed("provider has no token endpoint".to_string()));
        }

        Ok(metadata)
    }
}

/// Runs the OAuth2 client-credentials grant on every call.
pub struct ClientCredentialsSource {
    http: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scopes: Vec<String>,
    audience: Option<String>,
}

/// Token endpoint response body.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl ClientCredentialsSource {
    pub fn new(http: Client, token_url: impl Into<String>, settings: &OidcSettings) -> Self {
        Self {
            http,
            token_url: token_url.into(),
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            scopes: settings.scopes().into_iter().map(String::from).collect(),
            audience: settings.audience.clone(),
        }
    }
}

#[async_trait]
impl TokenSource for ClientCredentialsSource {
    #[instrument(skip(self), fields(token_url = %self.token_url), level = "debug")]
    async fn token(&self) -> Result<Token> {
        let mut form = vec![("grant_type", "client_credentials".to_string())];
        if !self.scopes.is_empty() {
            form.push(("scope", self.scopes.join(" ")));
        }
        if let Some(audience) = &self.audience {
            form.push(("audience", audience.clone()));
        }

        // RFC 6749 2.3.1: credentials are form-encoded before going into Basic auth.
        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(
                form_encode(&self.client_id),
                Some(form_encode(&self.client_secret)),
            )
            .form(&form)
            .send()
            .await
            .map_err(|e| ContextError::TokenFetch(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ContextError::TokenFetch(e.to_string()))?;

        if !status.is_success() {
            return Err(ContextError::TokenFetch(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| ContextError::TokenFetch(format!("invalid token response: {}", e)))?;
        if parsed.access_token.is_empty() {
            return Err(ContextError::TokenFetch(
                "server response missing access_token".to_string(),
            ));
        }

        let expiry = parsed
            .expires_in
            .filter(|secs| *secs > 0)
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));

        debug!("Fetched token from {}", self.token_url);
        Ok(Token {
            access_token: parsed.access_token,
            token_type: parsed.token_type,
            refresh_token: parsed.refresh_token,
            expiry,
        })
    }
}

fn form_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Keeps the last token and only asks `inner` for a new one when it is stale.
pub struct ReuseTokenSource {
    current: Mutex<Option<Token>>,
    inner: SharedTokenSource,
}

impl ReuseTokenSource {
    pub fn new(initial: Option<Token>, inner: SharedTokenSource) -> Self {
        Self {
            current: Mutex::new(initial),
            inner,
        }
    }
}

#[async_trait]
impl TokenSource for ReuseTokenSource {
    async fn token(&self) -> Result<Token> {
        let mut current = self.current.lock().await;
        if let Some(token) = current.as_ref() {
            if !token.needs_refresh_at(Utc::now()) {
                return Ok(token.clone());
            }
        }

        let fresh = self.inner.token().await?;
        *current = Some(fresh.clone());
        Ok(fresh)
    }
}

/// An HTTP client that attaches the tenant's bearer token, if any, to every
/// request it sends.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    source: Option<SharedTokenSource>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("authenticated", &self.source.is_some())
            .finish()
    }
}

impl ApiClient {
    pub fn unauthenticated(http: Client) -> Self {
        Self { http, source: None }
    }

    pub fn authenticated(http: Client, source: SharedTokenSource) -> Self {
        Self {
            http,
            source: Some(source),
        }
    }

    /// Same credentials over a different underlying client.
    pub fn with_transport(self, http: Client) -> Self {
        Self { http, ..self }
    }

    pub fn is_authenticated(&self) -> bool {
        self.source.is_some()
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn request(&self, method: Method, url: impl reqwest::IntoUrl) -> RequestBuilder {
        self.http.request(method, url)
    }

    /// Add the `Authorization` header, refreshing the token if needed.
    pub async fn authorize(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        match &self.source {
            Some(source) => {
                let token = source.token().await?;
                Ok(builder.header(AUTHORIZATION, token.authorization_value()))
            }
            None => Ok(builder),
        }
    }

    pub async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = self.authorize(builder).await?.send().await?;
        Ok(response)
    }

    pub async fn get(&self, url: impl reqwest::IntoUrl) -> Result<Response> {
        self.send(self.request(Method::GET, url)).await
    }
}

/// The current context together with a client bound to its credentials.
#[derive(Debug, Clone)]
pub struct BoundContext {
    pub context: ResolvedContext,
    pub client: ApiClient,
}

/// Turns tenant OIDC settings into authenticated clients.
#[derive(Debug, Clone)]
pub struct CredentialProvider {
    http: Client,
    span: Span,
}

impl CredentialProvider {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_HTTP_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_http_client(http))
    }

    pub fn with_http_client(http: Client) -> Self {
        Self {
            http,
            span: tracing::debug_span!("credentials"),
        }
    }

    /// Log provider activity under `span` instead of the default one.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Build a client for `tenant`, returning the tenant with the token that
    /// was resolved. The input is never modified; persisting the returned
    /// entry is up to the caller.
    pub async fn client_for(&self, tenant: &TenantEntry) -> Result<(ApiClient, TenantEntry)> {
        let span = tracing::debug_span!(parent: &self.span, "client_for", tenant = %tenant.tenant);
        async move {
            let Some(oidc) = &tenant.oidc else {
                debug!("no oidc settings, using unauthenticated client");
                return Ok((ApiClient::unauthenticated(self.http.clone()), tenant.clone()));
            };

            let metadata = ProviderMetadata::discover(&self.http, &oidc.issuer_url).await?;
            let source = Arc::new(ClientCredentialsSource::new(
                self.http.clone(),
                metadata.token_endpoint,
                oidc,
            ));
            self.client_with_source(tenant, source).await
        }
        .instrument(span)
        .await
    }

    /// Like [`CredentialProvider::client_for`] with an explicit source for new
    /// tokens instead of the provider's token endpoint.
    pub async fn client_with_source(
        &self,
        tenant: &TenantEntry,
        source: SharedTokenSource,
    ) -> Result<(ApiClient, TenantEntry)> {
        let Some(oidc) = &tenant.oidc else {
            return Ok((ApiClient::unauthenticated(self.http.clone()), tenant.clone()));
        };

        // A token that passes the strict check is kept as-is; the refresh
        // margin only applies to later requests.
        let cached = oidc
            .token
            .clone()
            .filter(|token| token.is_reusable_at(Utc::now()));
        let token = match cached {
            Some(token) => {
                debug!(tenant = %tenant.tenant, "reusing cached token");
                token
            }
            None => {
                let token = source.token().await?;
                debug!(tenant = %tenant.tenant, "fetched token");
                token
            }
        };
        let source = Arc::new(ReuseTokenSource::new(Some(token.clone()), source));

        let mut updated = tenant.clone();
        if let Some(oidc) = updated.oidc.as_mut() {
            oidc.token = Some(token);
        }
        Ok((ApiClient::authenticated(self.http.clone(), source), updated))
    }

    /// Client for the current context. The resolved token is written back to
    /// the store on every call.
    pub async fn client_for_current(&self, store: &ContextStore) -> Result<ApiClient> {
        Ok(self.bind_current(store).await?.client)
    }

    /// Resolve the current context, build its client and persist the token.
    pub async fn bind_current(&self, store: &ContextStore) -> Result<BoundContext> {
        let mut context = store.current()?;
        let (client, tenant) = self.client_for(&context.tenant).await?;

        store.save_tenant(&context.name.api, &context.name.tenant, tenant.clone())?;
        debug!(parent: &self.span, context = %context.name, "updated token in config file");

        context.tenant = tenant;
        Ok(BoundContext { context, client })
    }
}
