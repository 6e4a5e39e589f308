//! Secret redaction for log lines and transcripts
//!
//! The API token supplied with a deployment request must never reach the
//! client stream or a transcript file in full. A [`Redactor`] masks every
//! occurrence of the token and, independently, every standalone run of 64
//! alphanumeric characters (the shape of provider tokens), keeping the first
//! eight and last four characters so lines stay recognisable.

use regex::Regex;
use std::borrow::Cow;
use std::sync::OnceLock;

/// Shorter secrets are replaced entirely
const MIN_PARTIAL_LEN: usize = 16;

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\b[a-zA-Z0-9]{64}\b").unwrap_or_else(|_| unreachable!("static pattern"))
    })
}

/// Mask a secret as `first8...last4`
pub fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() < MIN_PARTIAL_LEN {
        return "[REDACTED]".to_string();
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

/// Masks a known secret and anything that looks like a provider token
#[derive(Clone)]
pub struct Redactor {
    secret: Option<String>,
    masked: String,
}

impl Redactor {
    /// Create a redactor for `secret` (blank secrets are ignored)
    pub fn new(secret: &str) -> Self {
        let secret = secret.trim();
        if secret.is_empty() {
            return Self::without_secret();
        }
        Self {
            secret: Some(secret.to_string()),
            masked: mask(secret),
        }
    }

    /// Redactor that only masks token-shaped runs
    pub fn without_secret() -> Self {
        Self {
            secret: None,
            masked: String::new(),
        }
    }

    /// Return `line` with secrets masked
    pub fn redact<'a>(&self, line: &'a str) -> Cow<'a, str> {
        let mut out = Cow::Borrowed(line);
        if let Some(secret) = &self.secret {
            if out.contains(secret.as_str()) {
                out = Cow::Owned(out.replace(secret.as_str(), &self.masked));
            }
        }
        let pattern = token_pattern();
        if pattern.is_match(&out) {
            out = Cow::Owned(
                pattern
                    .replace_all(&out, |caps: &regex::Captures<'_>| mask(&caps[0]))
                    .into_owned(),
            );
        }
        out
    }
}

impl std::fmt::Debug for Redactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redactor")
            .field("secret", &self.secret.as_ref().map(|_| &self.masked))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_in_prose_keeps_head_and_tail() {
        let token = "AbCdEfGh1234567890abcdefghijklmnopWXYZ";
        let token = format!("{}QR", token);
        assert_eq!(token.len(), 40);

        let redactor = Redactor::new(&token);
        let line = format!("Using token {} for hcloud", token);
        let out = redactor.redact(&line);

        assert_eq!(out, "Using token AbCdEfGh...YZQR for hcloud");
        assert!(!out.contains(&token));
    }

    #[test]
    fn test_unrelated_64_char_run_is_masked() {
        let redactor = Redactor::new("short-but-unrelated-token-value");
        let other = "a".repeat(30) + &"B".repeat(30) + "9876";
        let line = format!("key={} done", other);

        let out = redactor.redact(&line);
        assert_eq!(out, "key=aaaaaaaa...9876 done");
    }

    #[test]
    fn test_longer_runs_are_not_token_shaped() {
        let redactor = Redactor::without_secret();
        let run = "x".repeat(65);
        assert_eq!(redactor.redact(&run), run);
    }

    #[test]
    fn test_clean_lines_are_borrowed() {
        let redactor = Redactor::new("0123456789abcdef0123");
        assert!(matches!(redactor.redact("apt-get update"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_short_secret_fully_masked() {
        let redactor = Redactor::new("hunter2");
        assert_eq!(redactor.redact("pw=hunter2"), "pw=[REDACTED]");
        assert!(!format!("{:?}", redactor).contains("hunter2"));
    }
}
