//! ---
//! hatch_section: "01-core-functionality"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Shared primitives and utilities for the updater runtime."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

/// Platform, architecture and variant of the running build.
///
/// Names follow the release naming convention (`linux`/`darwin`/`windows`,
/// `amd64`/`arm64`/`386`) rather than Rust target triples.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformTarget {
    pub platform: String,
    pub arch: String,
    #[serde(default)]
    pub variant: String,
}

impl PlatformTarget {
    pub fn new(
        platform: impl Into<String>,
        arch: impl Into<String>,
        variant: impl Into<String>,
    ) -> Self {
        Self {
            platform: platform.into(),
            arch: arch.into(),
            variant: variant.into(),
        }
    }

    /// Target of the compiled binary, without a variant.
    pub fn detect() -> Self {
        Self::new(
            normalize_os(std::env::consts::OS),
            normalize_arch(std::env::consts::ARCH),
            "",
        )
    }

    /// Whether a descriptor triple belongs to this target.
    pub fn matches(&self, platform: &str, arch: &str, variant: &str) -> bool {
        self.platform.eq_ignore_ascii_case(platform)
            && self.arch.eq_ignore_ascii_case(arch)
            && self.variant.eq_ignore_ascii_case(variant)
    }
}

impl fmt::Display for PlatformTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.variant.is_empty() {
            write!(f, "{}/{}", self.platform, self.arch)
        } else {
            write!(f, "{}/{}/{}", self.platform, self.arch, self.variant)
        }
    }
}

pub fn normalize_os(os: &str) -> String {
    match os {
        "macos" => "darwin".to_owned(),
        other => other.to_owned(),
    }
}

pub fn normalize_arch(arch: &str) -> String {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64",
        other => other,
    }
    .to_owned()
}
