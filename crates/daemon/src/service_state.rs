use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::cache::FileCacheConfig;
use common::permissions::static_deny_page;
use common::prelude::{
    CookieUserStore, EventLog, FileCache, RateLimiter, RendererRegistry, ScriptEngine, UserStore,
};
use common::version::build_info;

use crate::ServiceConfig;

/// Everything a request handler needs, cheap to clone.
#[derive(Clone)]
pub struct State(Arc<Inner>);

struct Inner {
    config: ServiceConfig,
    serve_root: PathBuf,
    cache: Option<FileCache>,
    renderers: RendererRegistry,
    events: Arc<EventLog>,
    users: Arc<dyn UserStore>,
    limiter: Option<RateLimiter>,
    scripts: Option<Arc<dyn ScriptEngine>>,
    version: String,
}

impl State {
    pub fn from_config(config: &ServiceConfig) -> Result<Self, StateError> {
        StateBuilder::new(config.clone()).build()
    }

    pub fn builder(config: ServiceConfig) -> StateBuilder {
        StateBuilder::new(config)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.0.config
    }

    /// Absolute form of the served directory.
    pub fn serve_root(&self) -> &Path {
        &self.0.serve_root
    }

    /// `None` when caching is off.
    pub fn cache(&self) -> Option<&FileCache> {
        self.0.cache.as_ref()
    }

    pub fn renderers(&self) -> &RendererRegistry {
        &self.0.renderers
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.0.events
    }

    pub fn users(&self) -> &Arc<dyn UserStore> {
        &self.0.users
    }

    pub fn limiter(&self) -> Option<&RateLimiter> {
        self.0.limiter.as_ref()
    }

    pub fn scripts(&self) -> Option<&Arc<dyn ScriptEngine>> {
        self.0.scripts.as_ref()
    }

    /// `name/version`, shown on error pages.
    pub fn version(&self) -> &str {
        &self.0.version
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("serve_root", &self.0.serve_root)
            .field("cache_mode", &self.0.config.cache_mode)
            .field("renderers", &self.0.renderers)
            .field("scripts", &self.0.scripts.is_some())
            .finish()
    }
}

/// Assembles a [`State`], letting embedders swap in their own pieces.
pub struct StateBuilder {
    config: ServiceConfig,
    renderers: Option<RendererRegistry>,
    users: Option<Arc<dyn UserStore>>,
    scripts: Option<Arc<dyn ScriptEngine>>,
}

impl StateBuilder {
    fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            renderers: None,
            users: None,
            scripts: None,
        }
    }

    pub fn renderers(mut self, renderers: RendererRegistry) -> Self {
        self.renderers = Some(renderers);
        self
    }

    /// Replace the cookie based user store. Path rules from the config are still added.
    pub fn users(mut self, users: Arc<dyn UserStore>) -> Self {
        self.users = Some(users);
        self
    }

    pub fn scripts(mut self, engine: Arc<dyn ScriptEngine>) -> Self {
        self.scripts = Some(engine);
        self
    }

    pub fn build(self) -> Result<State, StateError> {
        let config = self.config;

        let serve_root = std::fs::canonicalize(&config.serve_dir).map_err(|e| {
            StateError::ServeDir {
                path: config.serve_dir.clone(),
                source: e,
            }
        })?;
        if !serve_root.is_dir() {
            return Err(StateError::NotADirectory(serve_root));
        }

        let cache = (!config.cache_mode.is_off()).then(|| {
            FileCache::new(FileCacheConfig {
                max_bytes: config.cache_size,
                max_entry_size: config.cache_max_entry,
                compress: config.compression,
                compress_min_size: config.compression_threshold,
                staleness_window: config.staleness_window,
            })
        });

        let users = match self.users {
            Some(users) => users,
            None => Arc::new(CookieUserStore::with_accounts(
                &config.permissions.admins,
                &config.permissions.users,
            )) as Arc<dyn UserStore>,
        };
        for prefix in &config.permissions.admin_paths {
            users.add_admin_path(prefix);
        }
        for prefix in &config.permissions.user_paths {
            users.add_user_path(prefix);
        }
        if let Some(page) = &config.permissions.deny_page {
            let html = std::fs::read(page).map_err(|e| StateError::DenyPage {
                path: page.clone(),
                source: e,
            })?;
            users.set_deny_handler(static_deny_page(html));
        }

        let limiter = config
            .rate_limit
            .map(|limit| RateLimiter::new(limit, config.limit_scope));

        let version = format!("{}/{}", config.server_name, build_info().version);

        tracing::debug!(
            root = %serve_root.display(),
            cache = %config.cache_mode,
            "service state ready"
        );

        Ok(State(Arc::new(Inner {
            events: Arc::new(EventLog::new(config.refresh_interval)),
            renderers: self.renderers.unwrap_or_default(),
            serve_root,
            cache,
            users,
            limiter,
            scripts: self.scripts,
            version,
            config,
        })))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("cannot serve {path:?}: {source}")]
    ServeDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("not a directory: {0:?}")]
    NotADirectory(PathBuf),
    #[error("failed to read deny page {path:?}: {source}")]
    DenyPage {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use common::prelude::{CacheMode, Role};

    use super::*;

    fn config(dir: &Path) -> ServiceConfig {
        ServiceConfig {
            serve_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let state = State::from_config(&config(dir.path())).unwrap();
        assert!(state.cache().is_some());
        assert!(state.limiter().is_some());
        assert!(state.scripts().is_none());
        assert_eq!(state.users().required_role("/admin/panel"), Role::Admin);
        assert_eq!(state.users().required_role("/_status/cache"), Role::Admin);
        assert_eq!(state.users().required_role("/repo/x"), Role::User);
        assert!(state.version().starts_with("livesite/"));
    }

    #[test]
    fn test_cache_off_builds_no_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.cache_mode = CacheMode::Off;
        config.rate_limit = None;
        let state = State::from_config(&config).unwrap();
        assert!(state.cache().is_none());
        assert!(state.limiter().is_none());
    }

    #[test]
    fn test_missing_serve_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir.path().join("nope"));
        assert!(matches!(
            State::from_config(&config),
            Err(StateError::ServeDir { .. })
        ));
    }
}
