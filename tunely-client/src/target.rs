//! Local target address handling.
//!
//! The relayed path is appended to the configured target URL as-is; the
//! agent never rewrites paths or query strings.

use anyhow::{anyhow, bail, Result};

#[derive(Debug, Clone)]
pub struct TargetUrl {
    authority: String,
    base_path: String,
}

impl TargetUrl {
    pub fn parse(raw: &str) -> Result<Self> {
        let rest = raw
            .trim()
            .strip_prefix("http://")
            .ok_or_else(|| anyhow!("only http:// targets are supported (got '{raw}')"))?;

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        if authority.is_empty() {
            bail!("target URL has no host");
        }

        let authority = if authority.contains(':') {
            authority.to_string()
        } else {
            format!("{authority}:80")
        };

        Ok(Self {
            authority,
            base_path: path.trim_end_matches('/').to_string(),
        })
    }

    /// `host:port` to dial.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Request URI for a relayed path: base path ⊕ path, untouched.
    pub fn request_uri(&self, path: &str) -> String {
        let joined = if path.starts_with('/') {
            format!("{}{}", self.base_path, path)
        } else {
            format!("{}/{}", self.base_path, path)
        };
        if joined.is_empty() {
            "/".to_string()
        } else {
            joined
        }
    }
}
