use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

/// Command-line configuration for obsctl.
#[derive(Parser, Debug, Clone)]
#[command(name = "obsctl")]
#[command(about = "CLI to interact with Observatorium", version)]
pub struct Config {
    /// Path to the context registry file
    #[arg(long, global = true, env = "OBSCTL_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Timeout for outbound HTTP requests, in seconds
    #[arg(long, global = true, default_value = "30", env = "OBSCTL_HTTP_TIMEOUT")]
    pub http_timeout: u64,

    /// Log filtering level
    #[arg(long = "log.level", global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Log format to use
    #[arg(long = "log.format", global = true, value_enum, default_value = "clilog")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout)
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Manage context configuration
    Context {
        #[command(subcommand)]
        command: ContextCommand,
    },

    /// Login as a tenant. Will also save tenant details locally
    Login(LoginArgs),

    /// Logout a tenant. Will remove locally saved details
    Logout {
        /// The name of the tenant to logout
        #[arg(long)]
        tenant: String,

        /// The name of the API the tenant is associated with
        #[arg(long)]
        api: String,
    },

    /// GET a tenant-scoped endpoint of the current API and print the raw body
    Get {
        /// Resource kind the endpoint belongs to
        #[arg(long, value_enum, default_value = "metrics")]
        resource: Resource,

        /// Endpoint below the tenant prefix, e.g. /api/v1/labels
        endpoint: String,
    },

    /// PUT a file to a tenant-scoped endpoint of the current API, raw rules by default
    Put {
        /// Resource kind the endpoint belongs to
        #[arg(long, value_enum, default_value = "metrics")]
        resource: Resource,

        /// File sent as the request body
        #[arg(long)]
        file: PathBuf,

        /// Content type of the file
        #[arg(long, default_value = "application/yaml")]
        content_type: String,

        /// Endpoint below the tenant prefix
        #[arg(default_value = "/api/v1/rules/raw")]
        endpoint: String,
    },

    /// Serve the current API locally, adding the tenant prefix to every path
    Proxy(ProxyArgs),
}

#[derive(Subcommand, Debug, Clone)]
pub enum ContextCommand {
    /// Add/remove API configuration
    Api {
        #[command(subcommand)]
        command: ApiCommand,
    },

    /// Switch to another context, given as <api>/<tenant>
    Switch { context: String },

    /// View current context configuration
    Current,

    /// List all saved contexts
    List,

    /// Remove a context given as <api>/<tenant>. An API left without tenants is removed too
    Rm { context: String },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ApiCommand {
    /// Add API configuration
    Add {
        /// The URL for the Observatorium API
        #[arg(long)]
        url: String,

        /// Optional name for the API; defaults to the URL host
        #[arg(long)]
        name: Option<String>,
    },

    /// Remove API configuration. If set to current, current will be emptied
    Rm {
        /// The name of the API to remove
        #[arg(long)]
        name: String,
    },
}

#[derive(Args, Debug, Clone)]
pub struct LoginArgs {
    /// The name of the tenant
    #[arg(long)]
    pub tenant: String,

    /// The name of the Observatorium API that has been saved previously
    #[arg(long)]
    pub api: String,

    /// Path to the TLS CA against which to verify the Observatorium API
    #[arg(long)]
    pub ca: Option<PathBuf>,

    /// The OIDC issuer URL
    #[arg(long = "oidc.issuer-url")]
    pub issuer_url: Option<String>,

    /// The OIDC client ID
    #[arg(long = "oidc.client-id")]
    pub client_id: Option<String>,

    /// The OIDC client secret
    #[arg(long = "oidc.client-secret", env = "OBSCTL_OIDC_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    /// The audience for whom the access token is intended
    #[arg(long = "oidc.audience")]
    pub audience: Option<String>,

    /// Request the offline_access scope
    #[arg(long = "oidc.offline-access", action = ArgAction::Set, default_value_t = true)]
    pub offline_access: bool,

    /// Save tenant details without fetching a token first
    #[arg(long = "disable.oidc-check")]
    pub disable_oidc_check: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ProxyArgs {
    /// Resource kind to serve
    #[arg(long, value_enum, default_value = "metrics")]
    pub resource: Resource,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080", env = "OBSCTL_PROXY_LISTEN")]
    pub listen: SocketAddr,

    /// Seconds to wait for in-flight requests on shutdown
    #[arg(long, default_value = "10")]
    pub shutdown_grace: u64,
}

/// Resource kinds the API serves under `api/<resource>/v1/<tenant>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Resource {
    Metrics,
    Logs,
    Traces,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Metrics => "metrics",
            Resource::Logs => "logs",
            Resource::Traces => "traces",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Error => write!(f, "error"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Debug => write!(f, "debug"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Clilog,
    Logfmt,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proxy_defaults() {
        let config = Config::try_parse_from(["obsctl", "proxy"]).unwrap();
        match config.command {
            Command::Proxy(args) => {
                assert_eq!(args.resource, Resource::Metrics);
                assert_eq!(args.listen, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.log_format, LogFormat::Clilog);
    }

    #[test]
    fn test_parse_login_flags() {
        let config = Config::try_parse_from([
            "obsctl",
            "--log.level",
            "debug",
            "login",
            "--api",
            "stage",
            "--tenant",
            "t1",
            "--oidc.issuer-url",
            "https://sso.example.com",
            "--oidc.client-id",
            "client",
            "--oidc.offline-access",
            "false",
        ])
        .unwrap();

        assert_eq!(config.log_level, LogLevel::Debug);
        let Command::Login(args) = config.command else {
            panic!("expected login");
        };
        assert_eq!(args.api, "stage");
        assert_eq!(args.issuer_url.as_deref(), Some("https://sso.example.com"));
        assert!(!args.offline_access);
        assert!(!args.disable_oidc_check);
    }

    #[test]
    fn test_parse_put_defaults() {
        let config = Config::try_parse_from(["obsctl", "put", "--file", "rules.yaml"]).unwrap();
        let Command::Put {
            resource,
            file,
            content_type,
            endpoint,
        } = config.command
        else {
            panic!("expected put");
        };
        assert_eq!(resource, Resource::Metrics);
        assert_eq!(file, PathBuf::from("rules.yaml"));
        assert_eq!(content_type, "application/yaml");
        assert_eq!(endpoint, "/api/v1/rules/raw");
    }

    #[test]
    fn test_parse_context_switch() {
        let config =
            Config::try_parse_from(["obsctl", "context", "switch", "stage/t1"]).unwrap();
        assert!(matches!(
            config.command,
            Command::Context {
                command: ContextCommand::Switch { ref context }
            } if context == "stage/t1"
        ));
    }
}
