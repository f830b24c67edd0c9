//! Tracing setup and redaction of text shown to the user.

use once_cell::sync::Lazy;
use regex::Regex;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "tabshell=info,warn";

/// Maximum message length before truncation
const MAX_MESSAGE_LENGTH: usize = 200;

/// Sensitive patterns to redact
static SENSITIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // SSH private key blocks
        r"(?s)-----BEGIN[^-]*PRIVATE KEY-----.*?-----END[^-]*PRIVATE KEY-----",
        // Generic secrets by key name (key=value patterns)
        r#"(?i)(password|passwd|pwd|secret|token|passphrase)\s*[:=]\s*["']?[^\s"']+["']?"#,
        // Long base64 runs (stored blobs, keys)
        r"[A-Za-z0-9+/]{64,}={0,2}",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Install the global `tracing` subscriber. Later calls are ignored.
pub fn init(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Strip anything that looks like a secret and cap the length
pub fn sanitize(input: &str) -> String {
    let mut result = input.to_string();
    for pattern in SENSITIVE_PATTERNS.iter() {
        result = pattern.replace_all(&result, "[REDACTED]").to_string();
    }

    if result.chars().count() > MAX_MESSAGE_LENGTH {
        let truncated: String = result.chars().take(MAX_MESSAGE_LENGTH).collect();
        result = format!("{}...", truncated);
    }
    result
}
