use std::fmt::{self, Display};

use serde::Serialize;

/// Name reported in the `Server` header and on error pages when nothing else is configured.
pub const SERVER_NAME: &str = "livesite";

/// Compile-time facts about the running binary, captured by `build.rs`.
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub repo_version: &'static str,
    pub build_profile: &'static str,
    pub build_features: &'static str,
    pub build_timestamp: &'static str,
}

impl BuildInfo {
    /// `name/version`, as shown at the bottom of error pages.
    pub fn version_string(&self) -> String {
        format!("{}/{}", self.name, self.version)
    }
}

impl Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}, {} build, features: {}, built {})",
            self.name,
            self.version,
            self.repo_version,
            self.build_profile,
            self.build_features,
            self.build_timestamp
        )
    }
}

pub fn build_info() -> BuildInfo {
    BuildInfo {
        name: SERVER_NAME,
        version: env!("CARGO_PKG_VERSION"),
        repo_version: env!("REPO_VERSION"),
        build_profile: env!("BUILD_PROFILE"),
        build_features: env!("BUILD_FEATURES"),
        build_timestamp: env!("BUILD_TIMESTAMP"),
    }
}
