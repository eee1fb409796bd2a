use std::path::PathBuf;

use clap::Args;

use livesite_daemon::service_config::{ConfigError, Settings};
use livesite_daemon::{spawn_service, ServiceConfig};

#[derive(Args, Debug, Clone, Default)]
pub struct Serve {
    /// Directory to serve (default: current directory)
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Listen address, like `:3000` or `localhost:8080`
    #[arg(long)]
    pub addr: Option<String>,

    /// PEM certificate chain for HTTPS
    #[arg(long, requires = "key")]
    pub cert: Option<PathBuf>,

    /// PEM private key for HTTPS
    #[arg(long, requires = "cert")]
    pub key: Option<PathBuf>,

    /// Cache mode: on, dev, prod, images, small or off
    #[arg(long)]
    pub cache: Option<String>,

    /// Total cache size in bytes
    #[arg(long)]
    pub cache_size: Option<u64>,

    /// Largest single cache entry in bytes
    #[arg(long)]
    pub cache_max_entry: Option<u64>,

    /// Store and send files uncompressed
    #[arg(long)]
    pub no_compression: bool,

    /// Reload open pages when files change
    #[arg(long, short = 'a')]
    pub autorefresh: bool,

    /// Event server address for auto-refresh
    #[arg(long)]
    pub event_addr: Option<String>,

    /// Event stream path for auto-refresh
    #[arg(long)]
    pub event_path: Option<String>,

    /// Auto-refresh poll interval in milliseconds
    #[arg(long)]
    pub refresh: Option<u64>,

    /// Requests per second
    #[arg(long)]
    pub limit: Option<u32>,

    /// Disable rate limiting
    #[arg(long, conflicts_with = "limit")]
    pub no_limit: bool,

    /// Rate limit scope: per-ip or global
    #[arg(long)]
    pub limit_scope: Option<String>,

    /// Serve a subdirectory per Host header
    #[arg(long)]
    pub per_host: bool,

    /// Only serve plain HTTP
    #[arg(long, conflicts_with = "http2")]
    pub http: bool,

    /// Only serve HTTP/2
    #[arg(long)]
    pub http2: bool,

    /// HTTPS on :443 and the site on :80 too, no auto-refresh, no debug pages
    #[arg(long)]
    pub prod: bool,

    /// With --prod, answer :80 with a redirect to HTTPS
    #[arg(long)]
    pub redirect_http: bool,

    /// Show error pages with the failing source
    #[arg(long, short = 'd')]
    pub debug: bool,

    /// Do not send the security headers
    #[arg(long)]
    pub no_headers: bool,

    /// Value of the Server header
    #[arg(long)]
    pub server_name: Option<String>,

    /// Page theme: gray, dark, bw or a stylesheet URL ending in .css
    #[arg(long)]
    pub theme: Option<String>,

    /// Directory for log files (logs to stdout only if not set)
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Log level: trace, debug, info, warn or error
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Serve {
    /// Only flags that were given, so they can be layered over the config file.
    fn settings(&self) -> Settings {
        fn flag(set: bool) -> Option<bool> {
            set.then_some(true)
        }

        Settings {
            dir: self.dir.clone(),
            addr: self.addr.clone(),
            cert: self.cert.clone(),
            key: self.key.clone(),
            cache: self.cache.clone(),
            cache_size: self.cache_size,
            cache_max_entry: self.cache_max_entry,
            no_compression: flag(self.no_compression),
            auto_refresh: flag(self.autorefresh),
            event_addr: self.event_addr.clone(),
            event_path: self.event_path.clone(),
            refresh_ms: self.refresh,
            limit: self.limit,
            no_limit: flag(self.no_limit),
            limit_scope: self.limit_scope.clone(),
            per_host: flag(self.per_host),
            http_only: flag(self.http),
            http2_only: flag(self.http2),
            production: flag(self.prod),
            debug: flag(self.debug),
            no_headers: flag(self.no_headers),
            redirect_http: flag(self.redirect_http),
            server_name: self.server_name.clone(),
            theme: self.theme.clone(),
            log_dir: self.log_dir.clone(),
            log_level: self.log_level.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Serve {
    type Error = ServeError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let file = Settings::discover(ctx.config_path.as_deref())?;
        let config = ServiceConfig::from_settings(file.overlay(self.settings()))?;

        spawn_service(&config).await;
        Ok("server stopped".to_string())
    }
}
