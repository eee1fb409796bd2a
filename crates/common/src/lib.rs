/**
 * Bounded, gzip-compressed file cache that
 *  stays consistent with what is on disk.
 */
pub mod cache;
/**
 * Recursive filesystem watcher feeding a short,
 *  time-ordered log of change events.
 */
pub mod events;
/**
 * Role checks and request rate limiting
 *  applied before a request is dispatched.
 */
pub mod permissions;
pub mod pretty_error;
/**
 * Live-reload script injection for served HTML.
 */
pub mod refresh;
/**
 * Renderer contract, registry and the
 *  built-in Markdown renderer.
 */
pub mod render;
pub mod theme;
/**
 * Helper for setting build version information
 *  at compile time.
 */
pub mod version;

pub mod prelude {
    pub use crate::cache::{CacheError, CacheMode, DataBlock, FileCache, FileCacheConfig};
    pub use crate::events::{coalesce, EventLog, EventStamp, FsEvent, FsEventKind};
    pub use crate::permissions::{
        CookieUserStore, DenyHandler, GateError, LimitScope, RateLimiter, Role, UserStore,
    };
    pub use crate::refresh::AutoRefresh;
    pub use crate::render::{
        Handling, RenderContext, RenderError, Renderer, RendererRegistry, ScriptEngine,
        SourceLang,
    };
    pub use crate::theme::Theme;
    pub use crate::version::build_info;
}
