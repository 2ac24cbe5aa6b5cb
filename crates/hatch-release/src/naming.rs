//! ---
//! hatch_section: "04-release-governance"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Release descriptors and release source clients."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
use url::Url;

/// Platform and architecture read off an asset file name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssetGuess {
    /// Guessed operating system family.
    pub platform: Option<&'static str>,
    /// Guessed architecture.
    pub arch: Option<&'static str>,
}

/// Guess platform and arch from names such as `tool_1.2.3_linux_amd64.tar.gz`,
/// `tool-windows-amd64.zip` or `tool_x86_64-unknown-linux-gnu.tar.xz`.
pub fn asset_name_guess(name: &str) -> AssetGuess {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name)
        .to_ascii_lowercase();
    let tokens: Vec<&str> = base
        .split(['-', '_', '.', ' '])
        .filter(|t| !t.is_empty())
        .collect();
    let has_token = |candidates: &[&str]| tokens.iter().any(|t| candidates.contains(t));

    let platform = if base.contains("windows") || base.ends_with(".exe") || has_token(&["win", "win32", "win64"]) {
        Some("windows")
    } else if base.contains("darwin")
        || base.contains("macos")
        || base.contains("osx")
        || has_token(&["mac", "apple"])
    {
        Some("darwin")
    } else if base.contains("linux") {
        Some("linux")
    } else if base.contains("freebsd") {
        Some("freebsd")
    } else if base.contains("openbsd") {
        Some("openbsd")
    } else if base.contains("netbsd") {
        Some("netbsd")
    } else if base.contains("android") {
        Some("android")
    } else {
        None
    };

    let arch = if base.contains("arm64") || base.contains("aarch64") {
        Some("arm64")
    } else if base.contains("amd64") || base.contains("x86_64") || base.contains("x86-64") {
        Some("amd64")
    } else if base.contains("ppc64le") {
        Some("ppc64le")
    } else if base.contains("ppc64") {
        Some("ppc64")
    } else if base.contains("s390x") {
        Some("s390x")
    } else if base.contains("riscv64") {
        Some("riscv64")
    } else if base.contains("armv7") || base.contains("armhf") {
        Some("arm")
    } else if has_token(&["386", "i386", "i686"]) || base.contains("x86-32") {
        Some("386")
    } else {
        None
    };

    AssetGuess { platform, arch }
}

/// Last non-empty path segment of a URL.
pub fn file_name_from_url(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    url.path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()
        .map(str::to_owned)
}

/// Checksum listings and signatures published next to release artifacts.
pub(crate) fn is_auxiliary_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    const SUFFIXES: [&str; 8] = [
        ".asc", ".sig", ".minisig", ".sha256", ".sha512", ".sha256sum", ".sha512sum", ".pem",
    ];
    SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
        || is_checksum_listing(&lower)
}

pub(crate) fn is_checksum_listing(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("checksums") || lower.starts_with("sha256sums") || lower.starts_with("sha512sums")
}

pub(crate) fn is_source_archive(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("source") || lower.contains("-src") || lower.contains("_src")
}
