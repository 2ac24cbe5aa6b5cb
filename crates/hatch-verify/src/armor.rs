//! ---
//! hatch_section: "06-integrity"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "ASCII armor parsing for keys and detached signatures."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
//! PEM-style blocks: a `-----BEGIN <label>-----` line, optional
//! `Name: value` headers ended by a blank line, base64 body, `-----END` line.

use base64::{engine::general_purpose, Engine as _};

use crate::{Result, VerifyError};

const BEGIN: &str = "-----BEGIN ";
const END: &str = "-----END ";
const DASHES: &str = "-----";

/// One decoded armor block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Armored {
    /// Block label, e.g. `PUBLIC KEY`.
    pub label: String,
    /// Header lines in order of appearance.
    pub headers: Vec<(String, String)>,
    /// Decoded body bytes.
    pub body: Vec<u8>,
}

impl Armored {
    /// Value of the first header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Label of the first armor block in `text`, without decoding it.
pub fn label(text: &str) -> Option<&str> {
    text.trim_start()
        .lines()
        .next()
        .and_then(|line| line.trim_end().strip_prefix(BEGIN))
        .and_then(|rest| rest.strip_suffix(DASHES))
}

/// Decode the armor block in `text`. Returns `Ok(None)` when `text` is not
/// armored at all.
pub fn parse(text: &str) -> Result<Option<Armored>> {
    let Some(label) = label(text) else {
        return Ok(None);
    };
    let malformed = |reason: &str| VerifyError::SignatureInvalid(format!("malformed {label} block: {reason}"));

    let mut lines = text.trim_start().lines().skip(1).map(str::trim_end);
    let mut headers = Vec::new();
    let mut body = String::new();
    let mut in_headers = true;
    let mut closed = false;
    for line in lines.by_ref() {
        if let Some(rest) = line.strip_prefix(END) {
            if rest.strip_suffix(DASHES) != Some(label) {
                return Err(malformed("mismatched end line"));
            }
            closed = true;
            break;
        }
        if in_headers {
            if line.is_empty() {
                in_headers = false;
                continue;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_owned(), value.trim().to_owned()));
                continue;
            }
            in_headers = false;
        }
        // Radix-64 checksum line.
        if line.starts_with('=') {
            continue;
        }
        body.push_str(line.trim());
    }
    if !closed {
        return Err(malformed("missing end line"));
    }
    let body = general_purpose::STANDARD
        .decode(body)
        .map_err(|err| malformed(&format!("body is not base64: {err}")))?;
    Ok(Some(Armored {
        label: label.to_owned(),
        headers,
        body,
    }))
}
