use std::convert::Infallible;
use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Largest file cached in [`CacheMode::Small`].
pub const SMALL_FILE_LIMIT: u64 = 64 * 1024;

/// Decides which file types are cacheable. It never changes how the cache works.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CacheMode {
    /// Cache everything.
    On,
    /// Cache everything except scripts and templates that change often.
    #[default]
    DevelopmentDefault,
    /// Cache everything except scripts.
    Production,
    /// Cache images only.
    Images,
    /// Like `Production`, limited to files of at most 64 KiB.
    Small,
    /// Cache nothing.
    Off,
}

impl CacheMode {
    /// Whether files with this extension (including the leading dot) may be cached.
    pub fn should_cache(&self, ext: &str) -> bool {
        match self {
            CacheMode::On => true,
            CacheMode::Production | CacheMode::Small => !matches!(ext, ".amber" | ".lua"),
            CacheMode::Images => matches!(
                ext,
                ".png" | ".jpg" | ".gif" | ".svg" | ".jpeg" | ".ico" | ".bmp" | ".apng"
            ),
            CacheMode::Off => false,
            CacheMode::DevelopmentDefault => {
                !matches!(ext, ".amber" | ".lua" | ".md" | ".gcss" | ".jsx")
            }
        }
    }

    /// Upper bound on the size of a cacheable file, if the mode has one.
    pub fn max_file_size(&self) -> Option<u64> {
        match self {
            CacheMode::Small => Some(SMALL_FILE_LIMIT),
            _ => None,
        }
    }

    /// Combines [`should_cache`](Self::should_cache) with the size bound.
    pub fn should_cache_file(&self, ext: &str, size: u64) -> bool {
        self.should_cache(ext) && self.max_file_size().map_or(true, |limit| size <= limit)
    }

    pub fn is_off(&self) -> bool {
        matches!(self, CacheMode::Off)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::On => "On",
            CacheMode::DevelopmentDefault => "Development",
            CacheMode::Production => "Production",
            CacheMode::Images => "Images",
            CacheMode::Small => "Small",
            CacheMode::Off => "Off",
        }
    }
}

impl FromStr for CacheMode {
    type Err = Infallible;

    /// Unknown strings resolve to [`CacheMode::DevelopmentDefault`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "on" | "all" | "everything" | "1" | "enabled" | "yes" | "enable" => CacheMode::On,
            "prod" | "production" => CacheMode::Production,
            "image" | "images" => CacheMode::Images,
            "small" | "64k" | "64KB" => CacheMode::Small,
            "off" | "disabled" | "0" | "no" | "disable" => CacheMode::Off,
            _ => CacheMode::DevelopmentDefault,
        })
    }
}

impl Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CacheMode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CacheMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        // infallible
        Ok(s.parse().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode(s: &str) -> CacheMode {
        s.parse().unwrap()
    }

    #[test]
    fn test_synonyms() {
        for s in ["on", "all", "everything", "1", "enabled", "yes", "enable"] {
            assert_eq!(mode(s), CacheMode::On, "{s}");
        }
        for s in ["prod", "production"] {
            assert_eq!(mode(s), CacheMode::Production, "{s}");
        }
        for s in ["image", "images"] {
            assert_eq!(mode(s), CacheMode::Images, "{s}");
        }
        for s in ["small", "64k", "64KB"] {
            assert_eq!(mode(s), CacheMode::Small, "{s}");
        }
        for s in ["off", "disabled", "0", "no", "disable"] {
            assert_eq!(mode(s), CacheMode::Off, "{s}");
        }
        for s in ["dev", "default", "unset", "whatever", "ON"] {
            assert_eq!(mode(s), CacheMode::DevelopmentDefault, "{s}");
        }
    }

    #[test]
    fn test_should_cache() {
        assert!(CacheMode::On.should_cache(".lua"));
        assert!(!CacheMode::Off.should_cache(".html"));

        assert!(!CacheMode::Production.should_cache(".lua"));
        assert!(!CacheMode::Production.should_cache(".amber"));
        assert!(CacheMode::Production.should_cache(".md"));

        assert!(!CacheMode::DevelopmentDefault.should_cache(".md"));
        assert!(!CacheMode::DevelopmentDefault.should_cache(".jsx"));
        assert!(CacheMode::DevelopmentDefault.should_cache(".txt"));

        assert!(CacheMode::Images.should_cache(".png"));
        assert!(!CacheMode::Images.should_cache(".html"));
    }

    #[test]
    fn test_small_mode_size_limit() {
        assert!(CacheMode::Small.should_cache_file(".txt", SMALL_FILE_LIMIT));
        assert!(!CacheMode::Small.should_cache_file(".txt", SMALL_FILE_LIMIT + 1));
        assert!(!CacheMode::Small.should_cache_file(".lua", 10));
        assert!(CacheMode::Production.should_cache_file(".txt", SMALL_FILE_LIMIT * 10));
    }

    #[test]
    fn test_deserialize_from_toml_string() {
        let mode: CacheMode = serde_json::from_str(r#""images""#).unwrap();
        assert_eq!(mode, CacheMode::Images);
    }
}
