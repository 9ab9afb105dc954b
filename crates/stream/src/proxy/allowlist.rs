//! Upstream URL allowlist.
//!
//! Only http(s) URLs whose host is an allowlisted domain or one of its
//! subdomains may be proxied. Matching is on whole labels, so
//! `api.openai.com.evil.com` does not match `api.openai.com`.

use url::Url;

pub struct Allowlist {
    hosts: Vec<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AllowlistError {
    #[error("invalid upstream url: {0}")]
    InvalidUrl(String),

    #[error("scheme {0} is not allowed")]
    SchemeNotAllowed(String),

    #[error("host {0} is not allowlisted")]
    HostDenied(String),
}

impl Allowlist {
    pub fn new(hosts: impl IntoIterator<Item = String>) -> Self {
        Self {
            hosts: hosts
                .into_iter()
                .map(|h| h.trim().trim_end_matches('.').to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }

    /// Validate a raw upstream URL, returning the parsed form.
    pub fn check(&self, raw: &str) -> Result<Url, AllowlistError> {
        let url = Url::parse(raw).map_err(|e| AllowlistError::InvalidUrl(e.to_string()))?;

        match url.scheme() {
            "http" | "https" => {}
            other => return Err(AllowlistError::SchemeNotAllowed(other.to_string())),
        }

        let host = url
            .host_str()
            .ok_or_else(|| AllowlistError::InvalidUrl("missing host".to_string()))?
            .trim_end_matches('.')
            .to_ascii_lowercase();

        let allowed = self
            .hosts
            .iter()
            .any(|h| host == *h || host.ends_with(&format!(".{}", h)));
        if !allowed {
            return Err(AllowlistError::HostDenied(host));
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowlist() -> Allowlist {
        Allowlist::new(["api.openai.com".to_string(), "example.org".to_string()])
    }

    #[test]
    fn allows_exact_host() {
        assert!(allowlist().check("https://api.openai.com/v1/chat").is_ok());
    }

    #[test]
    fn allows_subdomains() {
        assert!(allowlist().check("https://eu.example.org/data").is_ok());
    }

    #[test]
    fn denies_suffix_attack() {
        let err = allowlist()
            .check("https://api.openai.com.evil.com/v1")
            .unwrap_err();
        assert!(matches!(err, AllowlistError::HostDenied(_)));
    }

    #[test]
    fn denies_unlisted_host() {
        let err = allowlist().check("https://evil.com/").unwrap_err();
        assert!(matches!(err, AllowlistError::HostDenied(_)));
    }

    #[test]
    fn denies_non_http_schemes() {
        let err = allowlist().check("ftp://api.openai.com/file").unwrap_err();
        assert!(matches!(err, AllowlistError::SchemeNotAllowed(_)));
        let err = allowlist().check("file:///etc/passwd").unwrap_err();
        assert!(matches!(err, AllowlistError::SchemeNotAllowed(_)));
    }

    #[test]
    fn rejects_garbage() {
        let err = allowlist().check("not a url").unwrap_err();
        assert!(matches!(err, AllowlistError::InvalidUrl(_)));
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert!(allowlist().check("https://API.OPENAI.COM/v1").is_ok());
    }

    #[test]
    fn trailing_dots_do_not_bypass() {
        assert!(allowlist().check("https://api.openai.com./v1").is_ok());
        assert!(allowlist().check("https://evil.com./v1").is_err());
    }
}
