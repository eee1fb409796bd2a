//! Access control primitives used by the request gate
//!
//! A [`UserStore`] classifies each request as [`Role::Admin`],
//! [`Role::User`] or [`Role::Anonymous`] and knows the minimum role for each
//! path prefix. The [`RateLimiter`] is consulted only after the role check
//! passes.

mod rate_limit;

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::Arc;

use bytes::Bytes;
use http::header::{COOKIE, CONTENT_TYPE};
use http::{HeaderMap, Response, StatusCode, Uri};
use parking_lot::RwLock;

pub use rate_limit::{LimitScope, RateLimited, RateLimiter};

/// Cookie carrying the session token checked by [`CookieUserStore`].
pub const SESSION_COOKIE: &str = "livesite_session";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    Anonymous,
    User,
    Admin,
}

impl Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Anonymous => f.write_str("anonymous"),
            Role::User => f.write_str("user"),
            Role::Admin => f.write_str("admin"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error("permission denied: {path} requires {required}, request is {actual}")]
    PermissionDenied {
        path: String,
        required: Role,
        actual: Role,
    },
    #[error(transparent)]
    RateLimited(#[from] RateLimited),
}

/// Produces the response for a request that failed authorization.
pub type DenyHandler = Arc<dyn Fn(&Uri) -> Response<Bytes> + Send + Sync>;

/// Serve a fixed HTML page with 403 Forbidden.
pub fn static_deny_page(html: impl Into<Bytes>) -> DenyHandler {
    let html = html.into();
    Arc::new(move |_uri: &Uri| {
        let mut response = Response::new(html.clone());
        *response.status_mut() = StatusCode::FORBIDDEN;
        response.headers_mut().insert(
            CONTENT_TYPE,
            http::HeaderValue::from_static("text/html; charset=utf-8"),
        );
        response
    })
}

/// Identity and path rules, supplied by the embedding program.
pub trait UserStore: Send + Sync {
    /// Who is making this request.
    fn classify(&self, headers: &HeaderMap) -> Role;

    /// Minimum role needed for `path`.
    fn required_role(&self, path: &str) -> Role;

    /// The custom deny handler, if one was set.
    fn deny_handler(&self) -> Option<DenyHandler>;

    /// Forget all path rules, making everything public.
    fn clear(&self);

    fn add_user_path(&self, prefix: &str);

    fn add_admin_path(&self, prefix: &str);

    fn set_deny_handler(&self, handler: DenyHandler);

    /// Ok if the request may proceed to `path`.
    fn check(&self, path: &str, headers: &HeaderMap) -> Result<(), GateError> {
        let required = self.required_role(path);
        if required == Role::Anonymous {
            return Ok(());
        }
        let actual = self.classify(headers);
        if actual >= required {
            Ok(())
        } else {
            Err(GateError::PermissionDenied {
                path: path.to_string(),
                required,
                actual,
            })
        }
    }
}

#[derive(Default)]
struct PathRules {
    admin_prefixes: Vec<String>,
    user_prefixes: Vec<String>,
    deny: Option<DenyHandler>,
}

/// A [`UserStore`] that maps session-cookie tokens to users and admins.
#[derive(Default)]
pub struct CookieUserStore {
    rules: RwLock<PathRules>,
    /// session token -> (name, role)
    sessions: HashMap<String, (String, Role)>,
}

impl CookieUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `admins` and `users` map names to session tokens.
    pub fn with_accounts(
        admins: &HashMap<String, String>,
        users: &HashMap<String, String>,
    ) -> Self {
        let mut sessions = HashMap::new();
        for (name, token) in users {
            sessions.insert(token.clone(), (name.clone(), Role::User));
        }
        for (name, token) in admins {
            sessions.insert(token.clone(), (name.clone(), Role::Admin));
        }
        Self {
            rules: RwLock::new(PathRules::default()),
            sessions,
        }
    }

    fn session_token(headers: &HeaderMap) -> Option<&str> {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|cookies| cookies.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == SESSION_COOKIE)
            .map(|(_, value)| value)
    }

    /// Name of the user behind this request, if any.
    pub fn username(&self, headers: &HeaderMap) -> Option<&str> {
        let token = Self::session_token(headers)?;
        self.sessions.get(token).map(|(name, _)| name.as_str())
    }
}

impl fmt::Debug for CookieUserStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rules = self.rules.read();
        f.debug_struct("CookieUserStore")
            .field("admin_prefixes", &rules.admin_prefixes)
            .field("user_prefixes", &rules.user_prefixes)
            .field("accounts", &self.sessions.len())
            .field("custom_deny", &rules.deny.is_some())
            .finish()
    }
}

impl UserStore for CookieUserStore {
    fn classify(&self, headers: &HeaderMap) -> Role {
        Self::session_token(headers)
            .and_then(|token| self.sessions.get(token))
            .map(|(_, role)| *role)
            .unwrap_or(Role::Anonymous)
    }

    fn required_role(&self, path: &str) -> Role {
        let rules = self.rules.read();
        if rules.admin_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            Role::Admin
        } else if rules.user_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            Role::User
        } else {
            Role::Anonymous
        }
    }

    fn deny_handler(&self) -> Option<DenyHandler> {
        self.rules.read().deny.clone()
    }

    fn clear(&self) {
        let mut rules = self.rules.write();
        rules.admin_prefixes.clear();
        rules.user_prefixes.clear();
    }

    fn add_user_path(&self, prefix: &str) {
        self.rules.write().user_prefixes.push(prefix.to_string());
    }

    fn add_admin_path(&self, prefix: &str) {
        self.rules.write().admin_prefixes.push(prefix.to_string());
    }

    fn set_deny_handler(&self, handler: DenyHandler) {
        self.rules.write().deny = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn store() -> CookieUserStore {
        let admins = HashMap::from([("root".to_string(), "admintoken".to_string())]);
        let users = HashMap::from([("bob".to_string(), "usertoken".to_string())]);
        let store = CookieUserStore::with_accounts(&admins, &users);
        store.add_admin_path("/admin");
        store.add_user_path("/repo");
        store
    }

    fn with_cookie(cookie: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(cookie).unwrap());
        headers
    }

    #[test]
    fn test_classify() {
        let store = store();
        assert_eq!(store.classify(&HeaderMap::new()), Role::Anonymous);
        assert_eq!(
            store.classify(&with_cookie("theme=dark; livesite_session=usertoken")),
            Role::User
        );
        assert_eq!(
            store.classify(&with_cookie("livesite_session=admintoken")),
            Role::Admin
        );
        assert_eq!(
            store.classify(&with_cookie("livesite_session=guess")),
            Role::Anonymous
        );
        assert_eq!(
            store.username(&with_cookie("livesite_session=usertoken")),
            Some("bob")
        );
    }

    #[test]
    fn test_prefix_rules() {
        let store = store();
        assert_eq!(store.required_role("/admin/x"), Role::Admin);
        assert_eq!(store.required_role("/repo"), Role::User);
        assert_eq!(store.required_role("/index.html"), Role::Anonymous);

        store.clear();
        assert_eq!(store.required_role("/admin/x"), Role::Anonymous);
    }

    #[test]
    fn test_check() {
        let store = store();
        let anon = HeaderMap::new();
        let admin = with_cookie("livesite_session=admintoken");

        assert!(store.check("/public", &anon).is_ok());
        assert!(matches!(
            store.check("/admin/x", &anon),
            Err(GateError::PermissionDenied {
                required: Role::Admin,
                actual: Role::Anonymous,
                ..
            })
        ));
        assert!(store.check("/admin/x", &admin).is_ok());
        assert!(store.check("/repo/a", &admin).is_ok());
    }

    #[test]
    fn test_custom_deny_handler() {
        let store = store();
        assert!(store.deny_handler().is_none());
        store.set_deny_handler(static_deny_page("<p>go away</p>"));

        let handler = store.deny_handler().unwrap();
        let response = handler(&Uri::from_static("/admin"));
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.body().as_ref(), b"<p>go away</p>");
    }
}
