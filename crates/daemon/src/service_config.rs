use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use common::cache::{CacheMode, DEFAULT_CACHE_SIZE, DEFAULT_MAX_ENTRY_SIZE, DEFAULT_STALENESS_WINDOW};
use common::prelude::{LimitScope, Theme};
use common::version::SERVER_NAME;

/// Config file looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "livesite.toml";

pub const DEFAULT_ADDR: &str = ":3000";
pub const DEFAULT_EVENT_ADDR: &str = ":5553";
pub const DEFAULT_EVENT_PATH: &str = "/fs";
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(350);
pub const DEFAULT_RATE_LIMIT: u32 = 10;
/// Responses smaller than this are not worth compressing on the fly.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 4096;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How the supervisor picks the listeners it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolMode {
    /// HTTPS with HTTP/2 when a certificate is configured, plain HTTP otherwise
    /// or when TLS cannot be set up.
    #[default]
    Default,
    HttpOnly,
    Http2Only,
    /// HTTPS on :443 plus a redirecting HTTP listener on :80. TLS is required.
    Production,
}

#[derive(Debug, Clone, Default)]
pub struct PermissionsConfig {
    /// Path prefixes that require an admin.
    pub admin_paths: Vec<String>,
    /// Path prefixes that require a logged-in user.
    pub user_paths: Vec<String>,
    /// name -> session token
    pub admins: HashMap<String, String>,
    /// name -> session token
    pub users: HashMap<String, String>,
    /// HTML file served instead of the built-in 403 page.
    pub deny_page: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    // content
    /// Directory being served.
    pub serve_dir: PathBuf,
    /// Serve `<serve_dir>/<host>` based on the request's Host header.
    pub per_host: bool,
    pub theme: Theme,
    /// Show detailed error pages instead of a bare 500.
    pub debug: bool,

    // listeners
    /// Address for the main server, as given (`:3000`, `localhost:3000`).
    pub addr: String,
    pub listen_addr: SocketAddr,
    /// Host part of `addr`, if it had one.
    pub server_host: Option<String>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub protocol: ProtocolMode,
    pub server_name: String,
    /// In production mode, answer port 80 with a redirect to HTTPS instead
    /// of serving the site there too.
    pub redirect_http: bool,
    /// Add the usual hardening headers to responses.
    pub security_headers: bool,
    pub request_timeout: Duration,
    /// Budget for draining connections once shutdown starts.
    pub shutdown_timeout: Duration,

    // cache
    pub cache_mode: CacheMode,
    pub cache_size: u64,
    pub cache_max_entry: u64,
    pub staleness_window: Duration,
    pub compression: bool,
    pub compression_threshold: usize,

    // auto-refresh
    pub auto_refresh: bool,
    /// Event server address, as given. A leading `:` means "same host as the page".
    pub event_addr: String,
    pub event_listen_addr: SocketAddr,
    pub event_path: String,
    pub refresh_interval: Duration,
    /// `Access-Control-Allow-Origin` sent on the event stream.
    pub event_allow_origin: String,

    // access control
    /// Requests per second, `None` to disable limiting.
    pub rate_limit: Option<u32>,
    pub limit_scope: LimitScope,
    pub permissions: PermissionsConfig,

    // logging
    pub log_level: tracing::Level,
    /// Directory for log files (logs to stdout only if not set)
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let listen_addr = SocketAddr::from(([0, 0, 0, 0], 3000));
        let event_listen_addr = SocketAddr::from(([0, 0, 0, 0], 5553));
        Self {
            serve_dir: PathBuf::from("."),
            per_host: false,
            theme: Theme::default(),
            debug: false,
            addr: DEFAULT_ADDR.to_string(),
            listen_addr,
            server_host: None,
            cert_path: None,
            key_path: None,
            protocol: ProtocolMode::default(),
            server_name: SERVER_NAME.to_string(),
            redirect_http: false,
            security_headers: true,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            cache_mode: CacheMode::default(),
            cache_size: DEFAULT_CACHE_SIZE,
            cache_max_entry: DEFAULT_MAX_ENTRY_SIZE,
            staleness_window: DEFAULT_STALENESS_WINDOW,
            compression: true,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            auto_refresh: false,
            event_addr: DEFAULT_EVENT_ADDR.to_string(),
            event_listen_addr,
            event_path: DEFAULT_EVENT_PATH.to_string(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            event_allow_origin: "*".to_string(),
            rate_limit: Some(DEFAULT_RATE_LIMIT),
            limit_scope: LimitScope::default(),
            permissions: PermissionsConfig {
                admin_paths: vec!["/admin".to_string(), "/_status/cache".to_string()],
                user_paths: vec!["/repo".to_string(), "/data".to_string()],
                ..Default::default()
            },
            log_level: tracing::Level::INFO,
            log_dir: None,
        }
    }
}

impl Config {
    /// Build a config from file and command line settings layered over the defaults.
    pub fn from_settings(settings: Settings) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(dir) = settings.dir {
            config.serve_dir = dir;
        }
        config.per_host = settings.per_host.unwrap_or(config.per_host);
        if let Some(theme) = settings.theme {
            // unknown names fall back to the default theme
            config.theme = theme.parse().unwrap_or_default();
        }
        config.debug = settings.debug.unwrap_or(config.debug);

        let production = settings.production.unwrap_or(false);
        config.protocol = if production {
            ProtocolMode::Production
        } else if settings.http_only.unwrap_or(false) {
            ProtocolMode::HttpOnly
        } else if settings.http2_only.unwrap_or(false) {
            ProtocolMode::Http2Only
        } else {
            ProtocolMode::Default
        };
        if production {
            config.addr = ":443".to_string();
            config.cache_mode = CacheMode::Production;
            config.debug = false;
        }

        if let Some(addr) = settings.addr {
            config.addr = addr;
        }
        config.listen_addr = parse_listen_addr(&config.addr)?;
        config.server_host = host_part(&config.addr);
        config.cert_path = settings.cert;
        config.key_path = settings.key;
        if config.cert_path.is_some() != config.key_path.is_some() {
            return Err(ConfigError::IncompleteTls);
        }
        if production && config.cert_path.is_none() {
            return Err(ConfigError::ProductionNeedsTls);
        }
        if let Some(name) = settings.server_name {
            config.server_name = name;
        }
        config.security_headers = !settings.no_headers.unwrap_or(false);
        config.redirect_http = settings.redirect_http.unwrap_or(false);
        if let Some(secs) = settings.request_timeout_secs {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = settings.shutdown_timeout_secs {
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        if let Some(mode) = settings.cache {
            config.cache_mode = mode.parse().unwrap_or_default();
        }
        config.cache_size = settings.cache_size.unwrap_or(config.cache_size);
        config.cache_max_entry = settings.cache_max_entry.unwrap_or(config.cache_max_entry);
        config.compression = !settings.no_compression.unwrap_or(false);

        config.auto_refresh = settings.auto_refresh.unwrap_or(false) && !production;
        if let Some(event_addr) = settings.event_addr {
            config.event_addr = event_addr;
        }
        config.event_listen_addr = parse_listen_addr(&config.event_addr)?;
        if let Some(path) = settings.event_path {
            config.event_path = if path.starts_with('/') {
                path
            } else {
                format!("/{}", path)
            };
        }
        if let Some(ms) = settings.refresh_ms {
            if ms == 0 {
                return Err(ConfigError::InvalidRefresh);
            }
            config.refresh_interval = Duration::from_millis(ms);
        }
        if let Some(origin) = settings.event_allow_origin {
            config.event_allow_origin = origin;
        }

        config.rate_limit = if settings.no_limit.unwrap_or(false) {
            None
        } else {
            match settings.limit {
                Some(0) => None,
                Some(limit) => Some(limit),
                None => config.rate_limit,
            }
        };
        if let Some(scope) = settings.limit_scope {
            config.limit_scope = scope.parse().map_err(ConfigError::Invalid)?;
        }
        if let Some(permissions) = settings.permissions {
            config.permissions = permissions.into_config(config.permissions);
        }

        if let Some(level) = settings.log_level {
            config.log_level = level
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("unknown log level: {}", level)))?;
        }
        if settings.log_dir.is_some() {
            config.log_dir = settings.log_dir;
        }

        Ok(config)
    }

    pub fn tls_files(&self) -> Option<(&Path, &Path)> {
        match (&self.cert_path, &self.key_path) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

/// Optional settings as read from `livesite.toml` or the command line.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub dir: Option<PathBuf>,
    pub addr: Option<String>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub cache: Option<String>,
    pub cache_size: Option<u64>,
    pub cache_max_entry: Option<u64>,
    pub no_compression: Option<bool>,
    pub auto_refresh: Option<bool>,
    pub event_addr: Option<String>,
    pub event_path: Option<String>,
    pub event_allow_origin: Option<String>,
    pub refresh_ms: Option<u64>,
    pub limit: Option<u32>,
    pub no_limit: Option<bool>,
    pub limit_scope: Option<String>,
    pub per_host: Option<bool>,
    pub http_only: Option<bool>,
    pub http2_only: Option<bool>,
    pub production: Option<bool>,
    pub debug: Option<bool>,
    pub no_headers: Option<bool>,
    pub redirect_http: Option<bool>,
    pub server_name: Option<String>,
    pub theme: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub shutdown_timeout_secs: Option<u64>,
    pub log_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub permissions: Option<PermissionSettings>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Read `path`, or else the first [`DEFAULT_CONFIG_FILE`] found in the
    /// working directory or the user config directory. No file means no settings.
    pub fn discover(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let user_file = dirs::config_dir().map(|dir| dir.join("livesite").join(DEFAULT_CONFIG_FILE));
        let found = std::iter::once(PathBuf::from(DEFAULT_CONFIG_FILE))
            .chain(user_file)
            .find(|candidate| candidate.is_file());
        match found {
            Some(file) => Self::load(&file),
            None => Ok(Self::default()),
        }
    }

    /// Settings in `over` win over settings in `self`.
    pub fn overlay(self, over: Settings) -> Settings {
        Settings {
            dir: over.dir.or(self.dir),
            addr: over.addr.or(self.addr),
            cert: over.cert.or(self.cert),
            key: over.key.or(self.key),
            cache: over.cache.or(self.cache),
            cache_size: over.cache_size.or(self.cache_size),
            cache_max_entry: over.cache_max_entry.or(self.cache_max_entry),
            no_compression: over.no_compression.or(self.no_compression),
            auto_refresh: over.auto_refresh.or(self.auto_refresh),
            event_addr: over.event_addr.or(self.event_addr),
            event_path: over.event_path.or(self.event_path),
            event_allow_origin: over.event_allow_origin.or(self.event_allow_origin),
            refresh_ms: over.refresh_ms.or(self.refresh_ms),
            limit: over.limit.or(self.limit),
            no_limit: over.no_limit.or(self.no_limit),
            limit_scope: over.limit_scope.or(self.limit_scope),
            per_host: over.per_host.or(self.per_host),
            http_only: over.http_only.or(self.http_only),
            http2_only: over.http2_only.or(self.http2_only),
            production: over.production.or(self.production),
            debug: over.debug.or(self.debug),
            no_headers: over.no_headers.or(self.no_headers),
            redirect_http: over.redirect_http.or(self.redirect_http),
            server_name: over.server_name.or(self.server_name),
            theme: over.theme.or(self.theme),
            request_timeout_secs: over.request_timeout_secs.or(self.request_timeout_secs),
            shutdown_timeout_secs: over.shutdown_timeout_secs.or(self.shutdown_timeout_secs),
            log_dir: over.log_dir.or(self.log_dir),
            log_level: over.log_level.or(self.log_level),
            permissions: over.permissions.or(self.permissions),
        }
    }
}

/// The `[permissions]` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PermissionSettings {
    pub admin_paths: Option<Vec<String>>,
    pub user_paths: Option<Vec<String>>,
    pub admins: HashMap<String, String>,
    pub users: HashMap<String, String>,
    pub deny_page: Option<PathBuf>,
}

impl PermissionSettings {
    fn into_config(self, defaults: PermissionsConfig) -> PermissionsConfig {
        PermissionsConfig {
            admin_paths: self.admin_paths.unwrap_or(defaults.admin_paths),
            user_paths: self.user_paths.unwrap_or(defaults.user_paths),
            admins: self.admins,
            users: self.users,
            deny_page: self.deny_page,
        }
    }
}

/// Parse `:port`, `ip:port` or `host:port`. A bare `:port` listens on all interfaces.
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    if let Some(port) = addr.strip_prefix(':') {
        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::ListenAddr(addr.to_string()))?;
        return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
    }
    if let Ok(socket) = addr.parse() {
        return Ok(socket);
    }
    addr.to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ConfigError::ListenAddr(addr.to_string()))
}

fn host_part(addr: &str) -> Option<String> {
    let host = match addr.rsplit_once(':') {
        Some((host, _port)) => host,
        None => addr,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    (!host.is_empty()).then(|| host.to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid listen address: {0}")]
    ListenAddr(String),
    #[error("a certificate and a key must be given together")]
    IncompleteTls,
    #[error("production mode requires a certificate and key")]
    ProductionNeedsTls,
    #[error("refresh interval must be positive")]
    InvalidRefresh,
    #[error("{0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_settings(Settings::default()).unwrap();
        assert_eq!(config.listen_addr, SocketAddr::from(([0, 0, 0, 0], 3000)));
        assert_eq!(config.event_listen_addr.port(), 5553);
        assert_eq!(config.event_path, "/fs");
        assert_eq!(config.refresh_interval, Duration::from_millis(350));
        assert_eq!(config.rate_limit, Some(10));
        assert_eq!(config.cache_mode, CacheMode::DevelopmentDefault);
        assert_eq!(config.protocol, ProtocolMode::Default);
        assert!(config.server_host.is_none());
        assert!(config.compression);
        assert!(config.security_headers);
        assert!(!config.redirect_http);
    }

    #[test]
    fn test_parse_listen_addr() {
        assert_eq!(
            parse_listen_addr(":8080").unwrap(),
            SocketAddr::from(([0, 0, 0, 0], 8080))
        );
        assert_eq!(
            parse_listen_addr("127.0.0.1:9000").unwrap(),
            SocketAddr::from(([127, 0, 0, 1], 9000))
        );
        assert!(parse_listen_addr(":http").is_err());
        assert_eq!(host_part("localhost:3000").as_deref(), Some("localhost"));
        assert_eq!(host_part(":3000"), None);
    }

    #[test]
    fn test_overlay_prefers_later_settings() {
        let file: Settings = toml::from_str(
            r#"
            addr = ":4000"
            theme = "dark"
            limit = 5

            [permissions]
            admin_paths = ["/secret"]
            admins = { root = "t0ken" }
            "#,
        )
        .unwrap();
        let cli = Settings {
            addr: Some(":5000".to_string()),
            ..Default::default()
        };

        let config = Config::from_settings(file.overlay(cli)).unwrap();
        assert_eq!(config.listen_addr.port(), 5000);
        assert_eq!(config.theme, Theme::Dark);
        assert_eq!(config.rate_limit, Some(5));
        assert_eq!(config.permissions.admin_paths, vec!["/secret".to_string()]);
        assert_eq!(config.permissions.user_paths.len(), 2);
        assert_eq!(config.permissions.admins["root"], "t0ken");
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(toml::from_str::<Settings>("prot = 1").is_err());
    }

    #[test]
    fn test_production_requires_tls() {
        let settings = Settings {
            production: Some(true),
            ..Default::default()
        };
        assert!(matches!(
            Config::from_settings(settings),
            Err(ConfigError::ProductionNeedsTls)
        ));

        let settings = Settings {
            production: Some(true),
            auto_refresh: Some(true),
            cert: Some("cert.pem".into()),
            key: Some("key.pem".into()),
            ..Default::default()
        };
        let config = Config::from_settings(settings).unwrap();
        assert_eq!(config.protocol, ProtocolMode::Production);
        assert_eq!(config.listen_addr.port(), 443);
        assert_eq!(config.cache_mode, CacheMode::Production);
        assert!(!config.auto_refresh);
        assert!(!config.redirect_http);
    }

    #[test]
    fn test_redirect_http_is_opt_in() {
        let file: Settings = toml::from_str(
            r#"
            production = true
            cert = "cert.pem"
            key = "key.pem"
            "#,
        )
        .unwrap();
        let config = Config::from_settings(file.clone()).unwrap();
        assert!(!config.redirect_http);

        let cli = Settings {
            redirect_http: Some(true),
            ..Default::default()
        };
        let config = Config::from_settings(file.overlay(cli)).unwrap();
        assert!(config.redirect_http);

        let file: Settings = toml::from_str("redirect_http = true").unwrap();
        assert!(Config::from_settings(file).unwrap().redirect_http);
    }

    #[test]
    fn test_limit_switches() {
        let settings = Settings {
            no_limit: Some(true),
            ..Default::default()
        };
        assert_eq!(Config::from_settings(settings).unwrap().rate_limit, None);

        let settings = Settings {
            limit: Some(0),
            ..Default::default()
        };
        assert_eq!(Config::from_settings(settings).unwrap().rate_limit, None);

        let settings = Settings {
            limit_scope: Some("global".to_string()),
            ..Default::default()
        };
        assert_eq!(
            Config::from_settings(settings).unwrap().limit_scope,
            LimitScope::Global
        );
    }

    #[test]
    fn test_zero_refresh_is_rejected() {
        let settings = Settings {
            refresh_ms: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            Config::from_settings(settings),
            Err(ConfigError::InvalidRefresh)
        ));
    }
}
