//! Dispatch of parsed commands onto the context store and credential provider.

use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Context as _};
use obsctl_context::{
    ContextError, ContextName, ContextStore, CredentialProvider, OidcSettings, TenantEntry,
};
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use tracing::{debug, info};

use crate::config::{
    ApiCommand, Command, Config, ContextCommand, LoginArgs, ProxyArgs, Resource,
};
use crate::proxy::{ProxyServer, ProxySettings, ProxyTarget};
use crate::shutdown_signal;

pub async fn run(config: Config) -> anyhow::Result<()> {
    let store = match &config.config {
        Some(path) => ContextStore::new(path),
        None => ContextStore::from_env(),
    };
    debug!("Using config file {}", store.path().display());

    let timeout = config.http_timeout();
    match config.command {
        Command::Context { command } => context(&store, command),
        Command::Login(args) => login(&store, provider(timeout)?, args).await,
        Command::Logout { tenant, api } => {
            store
                .remove_tenant(&tenant, &api)
                .with_context(|| format!("logging out tenant {}/{}", api, tenant))?;
            info!("Logged out tenant {}/{}", api, tenant);
            Ok(())
        }
        Command::Get { resource, endpoint } => {
            scoped_request(
                &store,
                &provider(timeout)?,
                resource,
                Method::GET,
                &endpoint,
                None,
            )
            .await
        }
        Command::Put {
            resource,
            file,
            content_type,
            endpoint,
        } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let upload = Upload {
                content_type,
                bytes,
            };
            scoped_request(
                &store,
                &provider(timeout)?,
                resource,
                Method::PUT,
                &endpoint,
                Some(upload),
            )
            .await
        }
        Command::Proxy(args) => proxy(&store, &provider(timeout)?, args, timeout).await,
    }
}

fn provider(timeout: Duration) -> anyhow::Result<CredentialProvider> {
    CredentialProvider::with_timeout(timeout).context("building HTTP client")
}

fn context(store: &ContextStore, command: ContextCommand) -> anyhow::Result<()> {
    match command {
        ContextCommand::Api { command } => match command {
            ApiCommand::Add { url, name } => {
                let name = store
                    .add_api(name.as_deref(), &url)
                    .with_context(|| format!("adding API {}", url))?;
                info!("Added API {}", name);
            }
            ApiCommand::Rm { name } => {
                store
                    .remove_api(&name)
                    .with_context(|| format!("removing API {}", name))?;
                info!("Removed API {}", name);
            }
        },
        ContextCommand::Switch { context } => {
            let name: ContextName = context.parse()?;
            store.set_current(&name.api, &name.tenant)?;
            info!("Switched to context {}", name);
        }
        ContextCommand::Current => {
            let current = store.current()?;
            let mut out = std::io::stdout().lock();
            writeln!(out, "The current context is: {}", current.name)?;
            writeln!(out, "  API URL: {}", current.api.url)?;
            writeln!(out, "  Tenant:  {}", current.tenant.tenant)?;
            if let Some(oidc) = &current.tenant.oidc {
                writeln!(out, "  Issuer:  {}", oidc.issuer_url)?;
            }
        }
        ContextCommand::List => {
            let (contexts, current) = store.list_contexts()?;
            let mut out = std::io::stdout().lock();
            for name in contexts {
                let marker = if current.as_ref() == Some(&name) { "*" } else { " " };
                writeln!(out, "{} {}", marker, name)?;
            }
        }
        ContextCommand::Rm { context } => {
            let name: ContextName = context.parse()?;
            store.remove_context(&name.api, &name.tenant)?;
            info!("Removed context {}", name);
        }
    }
    Ok(())
}

async fn login(
    store: &ContextStore,
    provider: CredentialProvider,
    args: LoginArgs,
) -> anyhow::Result<()> {
    // Fail before talking to the provider if the API was never added.
    if store.load()?.api(&args.api).is_none() {
        return Err(ContextError::ApiNotFound(args.api).into());
    }

    let mut tenant = TenantEntry::new(&args.tenant);
    if let Some(ca) = &args.ca {
        let bytes = std::fs::read(ca)
            .with_context(|| format!("reading CA file {}", ca.display()))?;
        tenant = tenant.with_ca(bytes);
    }

    if let Some(issuer_url) = args.issuer_url {
        let (Some(client_id), Some(client_secret)) = (args.client_id, args.client_secret) else {
            bail!("--oidc.client-id and --oidc.client-secret are required with --oidc.issuer-url");
        };

        let mut oidc = OidcSettings::new(issuer_url, client_id, client_secret);
        oidc.offline_access = args.offline_access;
        if let Some(audience) = args.audience {
            oidc = oidc.with_audience(audience);
        }
        tenant = tenant.with_oidc(oidc);

        if !args.disable_oidc_check {
            let (_, checked) = provider
                .client_for(&tenant)
                .await
                .with_context(|| format!("fetching token for tenant {}", args.tenant))?;
            tenant = checked;
        }
    }

    match store.add_tenant_entry(&args.tenant, &args.api, tenant.clone()) {
        Ok(()) => info!("Logged in as tenant {}/{}", args.api, args.tenant),
        Err(e) if e.is_duplicate() => {
            store.save_tenant(&args.api, &args.tenant, tenant)?;
            info!("Tenant {}/{} was saved earlier, updated", args.api, args.tenant);
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// A request body read from a file.
struct Upload {
    content_type: String,
    bytes: Vec<u8>,
}

/// Send one request to `api/<resource>/v1/<tenant>/<endpoint>` of the current
/// context and print the raw response body.
async fn scoped_request(
    store: &ContextStore,
    provider: &CredentialProvider,
    resource: Resource,
    method: Method,
    endpoint: &str,
    upload: Option<Upload>,
) -> anyhow::Result<()> {
    let bound = provider.bind_current(store).await?;
    let base = bound.context.api.parsed_url()?;
    let target = ProxyTarget::new(base, resource, &bound.context.tenant.tenant);

    let (path, query) = match endpoint.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (endpoint, None),
    };
    let url = target.rewrite(path, query)?;
    debug!("{} {}", method, url);

    let mut request = bound.client.request(method, url.clone());
    if let Some(upload) = upload {
        request = request
            .header(CONTENT_TYPE, upload.content_type)
            .body(upload.bytes);
    }

    let response = bound
        .client
        .send(request)
        .await
        .with_context(|| format!("requesting {}", url))?;
    let status = response.status();
    let body = response.bytes().await.context("reading response body")?;

    let mut out = std::io::stdout().lock();
    out.write_all(&body)?;
    writeln!(out)?;

    if !status.is_success() {
        bail!("{} returned {}", url, status);
    }
    Ok(())
}

async fn proxy(
    store: &ContextStore,
    provider: &CredentialProvider,
    args: ProxyArgs,
    timeout: Duration,
) -> anyhow::Result<()> {
    let settings = ProxySettings {
        resource: args.resource,
        listen_addr: args.listen,
        timeout,
        shutdown_grace: Duration::from_secs(args.shutdown_grace),
    };

    let server = ProxyServer::new(store, provider, settings)
        .await
        .context("configuring proxy")?;
    server
        .bind()
        .await?
        .serve_until(shutdown_signal())
        .await?;

    info!("Proxy shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    fn parse(config_path: &std::path::Path, args: &[&str]) -> Config {
        let mut argv = vec!["obsctl", "--config", config_path.to_str().unwrap()];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[tokio::test]
    async fn test_context_commands_round_trip_through_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");

        run(parse(&path, &["context", "api", "add", "--url", "https://stage:9090", "--name", "stage"]))
            .await
            .unwrap();
        run(parse(&path, &["login", "--api", "stage", "--tenant", "t1"]))
            .await
            .unwrap();
        run(parse(&path, &["login", "--api", "stage", "--tenant", "t2"]))
            .await
            .unwrap();
        run(parse(&path, &["context", "switch", "stage/t2"]))
            .await
            .unwrap();

        let store = ContextStore::new(&path);
        let (_, current) = store.list_contexts().unwrap();
        assert_eq!(current, Some(ContextName::new("stage", "t2")));

        run(parse(&path, &["logout", "--api", "stage", "--tenant", "t2"]))
            .await
            .unwrap();
        assert!(matches!(store.get_current(), Err(ContextError::EmptyContext)));
    }

    #[tokio::test]
    async fn test_login_requires_known_api() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");

        let err = run(parse(&path, &["login", "--api", "missing", "--tenant", "t1"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ContextError>(),
            Some(ContextError::ApiNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_login_stores_ca_and_skips_oidc_check() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        let ca_path = temp_dir.path().join("ca.pem");
        std::fs::write(&ca_path, b"-----BEGIN CERTIFICATE-----").unwrap();

        run(parse(&path, &["context", "api", "add", "--url", "https://stage:9090", "--name", "stage"]))
            .await
            .unwrap();
        run(parse(
            &path,
            &[
                "login",
                "--api",
                "stage",
                "--tenant",
                "t1",
                "--ca",
                ca_path.to_str().unwrap(),
                "--oidc.issuer-url",
                "http://127.0.0.1:9",
                "--oidc.client-id",
                "client",
                "--oidc.client-secret",
                "secret",
                "--disable.oidc-check",
            ],
        ))
        .await
        .unwrap();

        let (tenant, _) = ContextStore::new(&path).get_current().unwrap();
        assert_eq!(tenant.ca.as_deref(), Some(&b"-----BEGIN CERTIFICATE-----"[..]));
        let oidc = tenant.oidc.unwrap();
        assert_eq!(oidc.client_id, "client");
        assert!(oidc.token.is_none());
    }

    #[tokio::test]
    async fn test_login_with_issuer_needs_client_credentials() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        run(parse(&path, &["context", "api", "add", "--url", "https://stage:9090", "--name", "stage"]))
            .await
            .unwrap();

        let config = Config::try_parse_from([
            "obsctl",
            "--config",
            path.to_str().unwrap(),
            "login",
            "--api",
            "stage",
            "--tenant",
            "t1",
            "--oidc.issuer-url",
            "https://sso.example.com",
        ])
        .unwrap();
        let Command::Login(mut args) = config.command else {
            panic!("expected login");
        };
        args.client_secret = None;

        let store = ContextStore::new(&path);
        assert!(login(&store, CredentialProvider::new().unwrap(), args).await.is_err());
        assert!(store.load().unwrap().api("stage").unwrap().contexts.is_empty());
    }

    #[tokio::test]
    async fn test_context_rm_drops_last_tenant_api() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");

        run(parse(&path, &["context", "api", "add", "--url", "https://stage:9090", "--name", "stage"]))
            .await
            .unwrap();
        run(parse(&path, &["login", "--api", "stage", "--tenant", "t1"]))
            .await
            .unwrap();
        run(parse(&path, &["context", "rm", "stage/t1"]))
            .await
            .unwrap();

        let registry = ContextStore::new(&path).load().unwrap();
        assert!(registry.apis().is_empty());
        assert!(registry.current().is_none());
    }

    async fn context_on(uri: &str, path: &std::path::Path) {
        let api_url = uri.to_string();
        run(parse(path, &["context", "api", "add", "--url", &api_url, "--name", "stage"]))
            .await
            .unwrap();
        run(parse(path, &["login", "--api", "stage", "--tenant", "t1"]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_put_sends_file_to_tenant_endpoint() {
        use wiremock::matchers::{body_string, header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let api = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/metrics/v1/t1/api/v1/rules/raw"))
            .and(header("content-type", "application/yaml"))
            .and(body_string("groups: []\n"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&api)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        let rules = temp_dir.path().join("rules.yaml");
        std::fs::write(&rules, "groups: []\n").unwrap();
        context_on(&api.uri(), &config_path).await;

        run(parse(&config_path, &["put", "--file", rules.to_str().unwrap()]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_put_reports_rejected_upload() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let api = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad rules"))
            .mount(&api)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        let rules = temp_dir.path().join("rules.yaml");
        std::fs::write(&rules, "not: [yaml").unwrap();
        context_on(&api.uri(), &config_path).await;

        let err = run(parse(&config_path, &["put", "--file", rules.to_str().unwrap()]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("400"));
    }

    #[tokio::test]
    async fn test_get_keeps_query_and_tenant_prefix() {
        use wiremock::matchers::{method, path, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let api = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/logs/v1/t1/loki/api/v1/labels"))
            .and(query_param("start", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&api)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        context_on(&api.uri(), &config_path).await;

        run(parse(
            &config_path,
            &["get", "--resource", "logs", "/loki/api/v1/labels?start=1"],
        ))
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_switch_rejects_malformed_context() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");

        let err = run(parse(&path, &["context", "switch", "no-separator"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ContextError>(),
            Some(ContextError::InvalidName { .. })
        ));
    }
}
