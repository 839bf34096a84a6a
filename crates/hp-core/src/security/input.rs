//! Strict allowlist-based input validation.
//!
//! Every external input that flows into subprocess arguments, file paths or
//! rendered config files passes through one of these validators first.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Errors returned when input fails validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),
    #[error("Invalid email address: {0}")]
    InvalidEmail(String),
    #[error("Invalid unit name: {0}")]
    InvalidUnitName(String),
    #[error("Invalid username: {0}")]
    InvalidUsername(String),
    #[error("Invalid PHP version: {0}")]
    InvalidPhpVersion(String),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("Invalid git ref: {0}")]
    InvalidGitRef(String),
    #[error("Invalid port: {0}")]
    InvalidPort(u32),
    #[error("Input too long: max {max} chars, got {actual}")]
    TooLong { max: usize, actual: usize },
    #[error("Input contains forbidden characters: {0}")]
    ForbiddenCharacters(String),
}

// ---------------------------------------------------------------------------
// Strict regex patterns -- allowlists only, never denylists.
// ---------------------------------------------------------------------------

/// Fully-qualified domain name (RFC 1035 / RFC 1123 compatible).
static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*\.[a-zA-Z]{2,}$",
    )
    .unwrap()
});

/// RFC 5321 compatible email address (simplified but safe).
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*\.[a-zA-Z]{2,}$",
    )
    .unwrap()
});

/// systemd unit name managed by the panel (without the `.service` suffix).
static UNIT_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]{1,128}$").unwrap());

/// Unix username: alphanumeric, dot, underscore, hyphen, 1-64 chars.
static USERNAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9._-]{1,64}$").unwrap());

/// PHP major.minor, e.g. `8.2`.
static PHP_VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[5-9]\.[0-9]$").unwrap());

/// Absolute path built from safe components.
static ABSOLUTE_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/[a-zA-Z0-9._/-]*$").unwrap());

/// Git branch or tag name.
static GIT_REF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9._/-]{1,255}$").unwrap());

/// Shell metacharacters that must never appear in input passed to subprocesses.
const SHELL_METACHARACTERS: &[char] = &[
    '`', '$', '(', ')', '{', '}', '[', ']', '|', ';', '&', '<', '>', '\n', '\r', '\0', '\\', '"',
    '\'',
];

// ---------------------------------------------------------------------------
// Public validation functions
// ---------------------------------------------------------------------------

/// Validate a fully-qualified domain name.
///
/// Rejects: empty, too long (>253), leading/trailing hyphens, bare TLDs,
/// whitespace, shell metacharacters, path traversal sequences.
pub fn validate_domain(domain: &str) -> Result<&str, ValidationError> {
    if domain.len() > 253 {
        return Err(ValidationError::TooLong {
            max: 253,
            actual: domain.len(),
        });
    }
    if !DOMAIN_RE.is_match(domain) {
        return Err(ValidationError::InvalidDomain(domain.to_string()));
    }
    Ok(domain)
}

pub fn validate_email(email: &str) -> Result<&str, ValidationError> {
    if email.len() > 254 {
        return Err(ValidationError::TooLong {
            max: 254,
            actual: email.len(),
        });
    }
    if !EMAIL_RE.is_match(email) {
        return Err(ValidationError::InvalidEmail(email.to_string()));
    }
    Ok(email)
}

pub fn validate_unit_name(name: &str) -> Result<&str, ValidationError> {
    if !UNIT_NAME_RE.is_match(name) {
        return Err(ValidationError::InvalidUnitName(name.to_string()));
    }
    Ok(name)
}

pub fn validate_username(username: &str) -> Result<&str, ValidationError> {
    if !USERNAME_RE.is_match(username) {
        return Err(ValidationError::InvalidUsername(username.to_string()));
    }
    Ok(username)
}

pub fn validate_php_version(version: &str) -> Result<&str, ValidationError> {
    if !PHP_VERSION_RE.is_match(version) {
        return Err(ValidationError::InvalidPhpVersion(version.to_string()));
    }
    Ok(version)
}

/// Validate an absolute filesystem path.
///
/// Rejects relative paths, `..` components and anything outside the
/// `[a-zA-Z0-9._/-]` allowlist.
pub fn validate_absolute_path(path: &str) -> Result<&str, ValidationError> {
    if path.len() > 4096 {
        return Err(ValidationError::TooLong {
            max: 4096,
            actual: path.len(),
        });
    }
    if !ABSOLUTE_PATH_RE.is_match(path) || path.split('/').any(|c| c == "..") {
        return Err(ValidationError::InvalidPath(path.to_string()));
    }
    Ok(path)
}

pub fn validate_git_ref(git_ref: &str) -> Result<&str, ValidationError> {
    if !GIT_REF_RE.is_match(git_ref) || git_ref.contains("..") || git_ref.starts_with('-') {
        return Err(ValidationError::InvalidGitRef(git_ref.to_string()));
    }
    Ok(git_ref)
}

pub fn validate_port(port: u32) -> Result<u16, ValidationError> {
    match u16::try_from(port) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(ValidationError::InvalidPort(port)),
    }
}

/// Assert that a string contains no shell metacharacters.
pub fn assert_no_shell_metacharacters(input: &str) -> Result<&str, ValidationError> {
    for ch in SHELL_METACHARACTERS {
        if input.contains(*ch) {
            return Err(ValidationError::ForbiddenCharacters(format!(
                "contains forbidden character: {:?}",
                ch
            )));
        }
    }
    Ok(input)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_domains() {
        assert!(validate_domain("example.com").is_ok());
        assert!(validate_domain("www.example.co.uk").is_ok());
        assert!(validate_domain("sub-domain.example.org").is_ok());
    }

    #[test]
    fn test_invalid_domains() {
        assert!(validate_domain("").is_err());
        assert!(validate_domain("-example.com").is_err());
        assert!(validate_domain("example").is_err());
        assert!(validate_domain("example.com; rm -rf /").is_err());
        assert!(validate_domain("../../../etc/passwd").is_err());
        assert!(validate_domain("example.com\ninjection").is_err());
    }

    #[test]
    fn test_domain_too_long() {
        let long_domain = format!("{}.com", "a".repeat(250));
        assert!(matches!(
            validate_domain(&long_domain),
            Err(ValidationError::TooLong { .. })
        ));
    }

    #[test]
    fn test_unit_names() {
        assert!(validate_unit_name("queue-worker_2").is_ok());
        assert!(validate_unit_name("my.service").is_err());
        assert!(validate_unit_name("../nginx").is_err());
        assert!(validate_unit_name("").is_err());
        assert!(validate_unit_name("a b").is_err());
    }

    #[test]
    fn test_php_versions() {
        assert!(validate_php_version("8.2").is_ok());
        assert!(validate_php_version("7.4").is_ok());
        assert!(validate_php_version("8").is_err());
        assert!(validate_php_version("8.2-fpm").is_err());
    }

    #[test]
    fn test_absolute_paths() {
        assert!(validate_absolute_path("/var/www/example_com").is_ok());
        assert!(validate_absolute_path("/").is_ok());
        assert!(validate_absolute_path("var/www").is_err());
        assert!(validate_absolute_path("/var/www/../../etc").is_err());
        assert!(validate_absolute_path("/var/www/site;id").is_err());
        assert!(validate_absolute_path("/var/www/my site").is_err());
    }

    #[test]
    fn test_git_refs() {
        assert!(validate_git_ref("main").is_ok());
        assert!(validate_git_ref("release/2.1").is_ok());
        assert!(validate_git_ref("--upload-pack=evil").is_err());
        assert!(validate_git_ref("main..dev").is_err());
        assert!(validate_git_ref("main;id").is_err());
    }

    #[test]
    fn test_ports() {
        assert_eq!(validate_port(3000), Ok(3000));
        assert!(validate_port(0).is_err());
        assert!(validate_port(70000).is_err());
    }

    #[test]
    fn test_username_validation() {
        assert!(validate_username("www-data").is_ok());
        assert!(validate_username("root; rm -rf /").is_err());
        assert!(validate_username("").is_err());
    }

    #[test]
    fn test_shell_metacharacter_rejection() {
        assert!(assert_no_shell_metacharacters("safe-input.123").is_ok());
        assert!(assert_no_shell_metacharacters("$(whoami)").is_err());
        assert!(assert_no_shell_metacharacters("`id`").is_err());
        assert!(assert_no_shell_metacharacters("foo;bar").is_err());
        assert!(assert_no_shell_metacharacters("foo\nbar").is_err());
    }

    #[test]
    fn test_email_validation() {
        assert!(validate_email("admin@example.com").is_ok());
        assert!(validate_email("admin@example.com; DROP TABLE sites;--").is_err());
    }
}
