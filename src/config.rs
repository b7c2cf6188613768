/// # Configuration Management
///
/// This module defines the structure of `config.yaml`, loads it, applies environment
/// overrides and validates it into the immutable settings the gateway is built from.
///
/// ## Key Components:
///
/// - **`AppConfig` and related structs**: `serde`-deserializable structures that mirror
///   the hierarchy of the `config.yaml` file.
///
/// - **`AppConfig::validate`**: checks every section and collects all problems into one
///   `ConfigError::Invalid`, so a broken file is reported in a single pass. On success it
///   returns a `GatewayConfig` holding provider settings, upstream servers and header
///   injection rules ready for use.
///
/// ## Environment
///
/// - `OIDCGW_CONFIG`: path of the configuration file (default `conf/config.yaml`).
/// - `OIDCGW_PORT`: listening port, overriding `port`.
/// - `OIDCGW_LOG_LEVEL`: log level, overriding `log.level`.
use std::collections::HashSet;
use std::fs;
use std::time::Duration;

use http::header::HeaderName;
use log::LevelFilter;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::claims::ClaimKind;
use crate::header_injection::{HeaderInjection, HeaderInjector};
use crate::oidc::provider::ProviderSettings;
use crate::oidc::{HEALTH_PATH, OIDC_MOUNT_PATH, READY_PATH};
use crate::proxy_url::ProxyUrl;
use crate::upstream::{UpstreamServer, DEFAULT_UPSTREAM_TIMEOUT};

pub const CONFIG_PATH: &str = "conf/config.yaml";
pub const CONFIG_PATH_ENV: &str = "OIDCGW_CONFIG";
pub const PORT_ENV: &str = "OIDCGW_PORT";
pub const LOG_LEVEL_ENV: &str = "OIDCGW_LOG_LEVEL";

pub const DEFAULT_PORT: u16 = 4180;
pub const DEFAULT_IDP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    pub port: Option<u16>,
    pub log: LogConfig,
    #[serde(rename = "proxyURL")]
    pub proxy_url: ProxyUrlConfig,
    pub oidc: OidcConfig,
    pub upstream: UpstreamConfig,
    pub header_injection: HeaderInjectionConfig,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub level: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ProxyUrlConfig {
    pub host: String,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct OidcConfig {
    pub skip_login_page: bool,
    pub identity_provider_timeout: Option<String>,
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderConfig {
    pub id: String,
    pub issuer: String,
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub client_secret: String,
    #[serde(rename = "redirectURL")]
    pub redirect_url: String,
    pub start_path: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct UpstreamConfig {
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub id: String,
    pub url: String,
    pub match_path: String,
    pub timeout: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct HeaderInjectionConfig {
    pub request: Vec<InjectorConfig>,
    pub response: Vec<InjectorConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct InjectorConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub values: Vec<String>,
}

/// Validated configuration the gateway is assembled from.
pub struct GatewayConfig {
    pub port: u16,
    pub log_level: LevelFilter,
    pub proxy_url: ProxyUrl,
    pub skip_login_page: bool,
    pub idp_timeout: Duration,
    pub providers: Vec<ProviderSettings>,
    pub servers: Vec<UpstreamServer>,
    pub injection: HeaderInjection,
}

pub fn load_app_config(path: &str) -> Result<AppConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source,
    })?;
    parse_app_config(&content).map_err(|source| ConfigError::Parse {
        path: path.to_string(),
        source,
    })
}

pub fn parse_app_config(content: &str) -> Result<AppConfig, serde_yaml::Error> {
    serde_yaml::from_str(content)
}

/// Durations use the `humantime` syntax: `30s`, `500ms`, `1m30s`, `2h 15min`.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    humantime::parse_duration(raw.trim())
        .map_err(|e| format!("'{}' is not a valid duration: {}", raw, e))
}

fn parse_log_level(raw: &str) -> Option<LevelFilter> {
    match raw.to_ascii_lowercase().as_str() {
        "trace" => Some(LevelFilter::Trace),
        "debug" => Some(LevelFilter::Debug),
        "info" => Some(LevelFilter::Info),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "error" => Some(LevelFilter::Error),
        _ => None,
    }
}

/// Zero or more `/segment` parts, each segment from `[A-Za-z0-9_-]`. A trailing
/// slash is allowed.
fn is_valid_start_path(path: &str) -> bool {
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    rest.is_empty()
        || rest.split('/').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}

fn is_under_mount_point(path: &str) -> bool {
    path.strip_prefix(OIDC_MOUNT_PATH)
        .is_some_and(|rest| rest.starts_with('/') && rest.len() > 1)
}

fn parse_https_url(raw: &str, what: &str, problems: &mut Vec<String>) -> Option<Url> {
    match Url::parse(raw) {
        Ok(url) if url.scheme() == "https" && url.host_str().is_some() => Some(url),
        Ok(_) => {
            problems.push(format!("{} '{}' must be an https:// url", what, raw));
            None
        }
        Err(e) => {
            problems.push(format!("{} '{}' is not a valid url: {}", what, raw, e));
            None
        }
    }
}

impl AppConfig {
    /// Applies `OIDCGW_PORT` / `OIDCGW_LOG_LEVEL` style overrides.
    pub fn apply_overrides(
        &mut self,
        port: Option<String>,
        log_level: Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(port) = port {
            let parsed = port.trim().parse::<u16>().map_err(|_| {
                ConfigError::Invalid(vec![format!("{} '{}' is not a valid port", PORT_ENV, port)])
            })?;
            self.port = Some(parsed);
        }
        if let Some(level) = log_level {
            self.log.level = Some(level);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<GatewayConfig, ConfigError> {
        let mut problems = Vec::new();

        let log_level = match self.log.level.as_deref() {
            None => LevelFilter::Info,
            Some(raw) => parse_log_level(raw).unwrap_or_else(|| {
                problems.push(format!("log.level '{}' is not a known level", raw));
                LevelFilter::Info
            }),
        };

        let proxy_url = match ProxyUrl::new(&self.proxy_url.host) {
            Ok(proxy_url) => Some(proxy_url),
            Err(e) => {
                problems.push(format!("proxyURL.host: {}", e));
                None
            }
        };

        let idp_timeout = match self.oidc.identity_provider_timeout.as_deref() {
            None => DEFAULT_IDP_TIMEOUT,
            Some(raw) => parse_duration(raw).unwrap_or_else(|e| {
                problems.push(format!("oidc.identityProviderTimeout: {}", e));
                DEFAULT_IDP_TIMEOUT
            }),
        };

        let providers = self.validate_providers(&mut problems);
        let servers = self.validate_servers(&mut problems);
        let injection = HeaderInjection {
            request: validate_injectors(
                &self.header_injection.request,
                "request",
                &mut problems,
            ),
            response: validate_injectors(
                &self.header_injection.response,
                "response",
                &mut problems,
            ),
        };

        match proxy_url {
            Some(proxy_url) if problems.is_empty() => Ok(GatewayConfig {
                port: self.port.unwrap_or(DEFAULT_PORT),
                log_level,
                proxy_url,
                skip_login_page: self.oidc.skip_login_page,
                idp_timeout,
                providers,
                servers,
                injection,
            }),
            _ => Err(ConfigError::Invalid(problems)),
        }
    }

    fn validate_providers(&self, problems: &mut Vec<String>) -> Vec<ProviderSettings> {
        let configured = &self.oidc.providers;
        if configured.is_empty() {
            problems.push("oidc.providers must list at least one provider".to_string());
        }
        if self.oidc.skip_login_page && configured.len() != 1 {
            problems.push(format!(
                "oidc.skipLoginPage requires exactly one provider, {} configured",
                configured.len()
            ));
        }

        let mut ids = HashSet::new();
        let mut paths: HashSet<String> = [HEALTH_PATH.to_string(), READY_PATH.to_string()].into();
        let mut settings = Vec::new();
        for (index, provider) in configured.iter().enumerate() {
            let label = if provider.id.is_empty() {
                format!("oidc.providers[{}]", index)
            } else {
                format!("provider '{}'", provider.id)
            };
            let before = problems.len();

            if provider.id.is_empty() {
                problems.push(format!("{}: id must not be empty", label));
            } else if !ids.insert(provider.id.as_str()) {
                problems.push(format!("{}: id is used more than once", label));
            }
            if provider.client_id.is_empty() {
                problems.push(format!("{}: clientID must not be empty", label));
            }
            parse_https_url(&provider.issuer, &format!("{}: issuer", label), problems);
            let redirect_url = parse_https_url(
                &provider.redirect_url,
                &format!("{}: redirectURL", label),
                problems,
            );
            if let Some(url) = &redirect_url {
                if !is_under_mount_point(url.path()) {
                    problems.push(format!(
                        "{}: redirectURL path '{}' must lie under {}",
                        label,
                        url.path(),
                        OIDC_MOUNT_PATH
                    ));
                } else if !paths.insert(url.path().to_string()) {
                    problems.push(format!(
                        "{}: redirectURL path '{}' collides with another endpoint",
                        label,
                        url.path()
                    ));
                }
            }
            if !is_valid_start_path(&provider.start_path) {
                problems.push(format!(
                    "{}: startPath '{}' must look like /segment[/segment...]",
                    label, provider.start_path
                ));
            } else if !paths.insert(format!("{}{}", OIDC_MOUNT_PATH, provider.start_path)) {
                problems.push(format!(
                    "{}: startPath '{}' collides with another endpoint",
                    label, provider.start_path
                ));
            }

            if problems.len() > before {
                continue;
            }
            let Some(redirect_url) = redirect_url else {
                continue;
            };
            let mut scopes = provider.scopes.clone();
            if !scopes.iter().any(|scope| scope == "openid") {
                scopes.insert(0, "openid".to_string());
            }
            settings.push(ProviderSettings {
                id: provider.id.clone(),
                issuer: provider.issuer.clone(),
                client_id: provider.client_id.clone(),
                client_secret: provider.client_secret.clone(),
                redirect_url,
                start_path: provider.start_path.clone(),
                scopes,
            });
        }
        settings
    }

    fn validate_servers(&self, problems: &mut Vec<String>) -> Vec<UpstreamServer> {
        let configured = &self.upstream.servers;
        if configured.is_empty() {
            problems.push("upstream.servers must list at least one server".to_string());
        }
        let mut ids = HashSet::new();
        let mut servers = Vec::new();
        for (index, server) in configured.iter().enumerate() {
            let label = if server.id.is_empty() {
                format!("upstream.servers[{}]", index)
            } else {
                format!("upstream '{}'", server.id)
            };
            let before = problems.len();

            if server.id.is_empty() {
                problems.push(format!("{}: id must not be empty", label));
            } else if !ids.insert(server.id.as_str()) {
                problems.push(format!("{}: id is used more than once", label));
            }
            if !server.match_path.starts_with('/') {
                problems.push(format!(
                    "{}: matchPath '{}' must start with /",
                    label, server.match_path
                ));
            }
            let timeout = match server.timeout.as_deref() {
                None => DEFAULT_UPSTREAM_TIMEOUT,
                Some(raw) => parse_duration(raw).unwrap_or_else(|e| {
                    problems.push(format!("{}: timeout: {}", label, e));
                    DEFAULT_UPSTREAM_TIMEOUT
                }),
            };
            let url = match Url::parse(&server.url) {
                Ok(url) => Some(url),
                Err(e) => {
                    problems.push(format!("{}: url '{}' is not valid: {}", label, server.url, e));
                    None
                }
            };

            if problems.len() > before {
                continue;
            }
            let Some(url) = url else {
                continue;
            };
            match UpstreamServer::new(&server.id, url, &server.match_path, timeout) {
                Ok(upstream) => servers.push(upstream),
                Err(e) => problems.push(e),
            }
        }
        servers
    }
}

fn validate_injectors(
    configured: &[InjectorConfig],
    side: &str,
    problems: &mut Vec<String>,
) -> Vec<HeaderInjector> {
    let mut names = HashSet::new();
    let mut injectors = Vec::new();
    for (index, rule) in configured.iter().enumerate() {
        let label = format!("headerInjection.{}[{}]", side, index);
        let before = problems.len();

        if HeaderName::from_bytes(rule.name.as_bytes()).is_err() {
            problems.push(format!("{}: '{}' is not a valid header name", label, rule.name));
        } else if !names.insert(rule.name.to_ascii_lowercase()) {
            problems.push(format!("{}: header '{}' is set more than once", label, rule.name));
        }
        if rule.values.is_empty() {
            problems.push(format!("{}: values must list at least one claim", label));
        }
        let mut claims = Vec::new();
        for value in &rule.values {
            match ClaimKind::from_name(value) {
                Some(kind) => claims.push(kind),
                None => problems.push(format!("{}: '{}' is not a known claim", label, value)),
            }
        }
        let header = rule.name.clone();
        let injector = match rule.kind.as_str() {
            "idTokenClaim" => HeaderInjector::IdTokenClaim { header, claims },
            "userInfo" => HeaderInjector::UserInfo { header, claims },
            other => {
                problems.push(format!("{}: '{}' is not a known type", label, other));
                continue;
            }
        };
        if problems.len() == before {
            injectors.push(injector);
        }
    }
    injectors
}
