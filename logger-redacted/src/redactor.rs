use base64::{engine::general_purpose, Engine as _};
use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};

lazy_static! {
    static ref AUTH_HEADER_REGEX: Regex =
        Regex::new(r"(?i)\b(Basic|Bearer)\s+[A-Za-z0-9+/=._~-]{4,}").unwrap();
    static ref URL_USERINFO_REGEX: Regex =
        Regex::new(r"(?i)\b([a-z][a-z0-9+.-]*://)[^/\s@]+@").unwrap();
    static ref QUERY_SECRET_REGEX: Regex =
        Regex::new(r"(?i)\b(password|passwd|token|access_token|api_key|secret)=([^&\s]+)").unwrap();
    static ref EMAIL_REGEX: Regex =
        Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap();
}

/// Mask the user-info part and secret query values of a URL
pub fn redact_url(url: &str) -> String {
    let without_userinfo = URL_USERINFO_REGEX.replace_all(url, "${1}***@");
    QUERY_SECRET_REGEX
        .replace_all(&without_userinfo, "${1}=[REDACTED]")
        .into_owned()
}

/// Redaction configuration
#[derive(Debug, Clone)]
pub struct RedactionConfig {
    pub redact_auth_headers: bool,
    pub redact_urls: bool,
    pub redact_emails: bool,
    pub hash_for_correlation: bool,
    pub custom_patterns: Vec<(Regex, String)>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            redact_auth_headers: true,
            redact_urls: true,
            redact_emails: true,
            hash_for_correlation: true,
            custom_patterns: Vec::new(),
        }
    }
}

/// Masks credentials and account identifiers in log text
#[derive(Debug, Clone, Default)]
pub struct CredentialRedactor {
    config: RedactionConfig,
}

impl CredentialRedactor {
    pub fn new(config: RedactionConfig) -> Self {
        Self { config }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut result = text.to_string();

        if self.config.redact_auth_headers {
            result = AUTH_HEADER_REGEX
                .replace_all(&result, "${1} [REDACTED]")
                .into_owned();
        }

        // User-info looks like an email address, so it goes first
        if self.config.redact_urls {
            result = redact_url(&result);
        }

        if self.config.redact_emails {
            result = self.redact_emails(&result);
        }

        for (pattern, replacement) in &self.config.custom_patterns {
            result = pattern.replace_all(&result, replacement.as_str()).into_owned();
        }

        result
    }

    fn redact_emails(&self, text: &str) -> String {
        EMAIL_REGEX
            .replace_all(text, |caps: &regex::Captures| {
                let email = &caps[0];
                if self.config.hash_for_correlation {
                    format!("EMAIL[{}]", hash_value(email))
                } else {
                    let (local, domain) = email.split_once('@').unwrap_or((email, ""));
                    let first = |s: &str| s.chars().next().map(String::from).unwrap_or_default();
                    format!("{}***@{}***", first(local), first(domain))
                }
            })
            .into_owned()
    }
}

/// Short stable digest so redacted values can still be correlated across lines
pub fn hash_value(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    let digest = hasher.finalize();
    let prefix: Vec<u8> = digest.iter().take(8).copied().collect();
    general_purpose::STANDARD.encode(prefix)
}
