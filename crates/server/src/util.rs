use rand::{distributions::Alphanumeric, Rng};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid email address")]
pub struct InvalidEmail;

/// Random alphanumeric string, used for credentials and session keys.
pub fn random_string(n: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(n)
        .map(char::from)
        .collect()
}

/// Random lowercase hex string, used for image tags.
pub fn random_hex(n: usize) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..n).map(|_| HEX[rng.gen_range(0..HEX.len())] as char).collect()
}

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "calm", "dapper", "eager", "frosty", "gentle", "hollow", "icy", "jolly",
    "keen", "lively", "mellow", "noble", "proud", "quiet", "rapid", "silent", "tidy", "vivid",
];

const NOUNS: &[&str] = &[
    "aurora", "breeze", "canyon", "delta", "ember", "falcon", "grove", "harbor", "island",
    "jungle", "lagoon", "meadow", "nebula", "oasis", "prairie", "ridge", "summit", "tundra",
    "valley", "willow",
];

/// Auto-generated app name for create requests that omit one.
pub fn generate_app_name() -> String {
    let mut rng = rand::thread_rng();
    let adj = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    format!("{adj}-{noun}")
}

/// Validate an email address: overall and local-part length bounds, a
/// restricted local-part character set, and a dotted host.
pub fn validate_email(email: &str) -> Result<(), InvalidEmail> {
    let email = email.trim();
    if email.len() < 6 || email.len() > 254 {
        return Err(InvalidEmail);
    }
    let at = email.rfind('@').ok_or(InvalidEmail)?;
    if at == 0 || at > email.len() - 3 {
        return Err(InvalidEmail);
    }
    let (user, host) = (&email[..at], &email[at + 1..]);
    if user.len() > 64 {
        return Err(InvalidEmail);
    }
    let user_ok = user.chars().all(|c| {
        c.is_ascii_alphanumeric() || "!#$%&'*+/=?^_`{|}~.-".contains(c)
    });
    let host_ok = host.contains('.') && !host.chars().any(char::is_whitespace);
    if !user_ok || !host_ok {
        return Err(InvalidEmail);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_string_has_requested_length() {
        assert_eq!(random_string(64).len(), 64);
        assert!(random_string(10).chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn random_hex_is_hex() {
        let tag = random_hex(6);
        assert_eq!(tag.len(), 6);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn successive_tags_differ() {
        // 6 hex chars = 24 bits of entropy; a collision here is vanishingly unlikely.
        let tags: std::collections::HashSet<String> = (0..32).map(|_| random_hex(6)).collect();
        assert!(tags.len() > 30);
    }

    #[test]
    fn app_name_shape() {
        let name = generate_app_name();
        let parts: Vec<&str> = name.split('-').collect();
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| !p.is_empty()));
    }

    #[test]
    fn valid_emails() {
        for e in ["jane@example.com", "a.b+c@sub.domain.org", "x_1@host.io"] {
            assert_eq!(validate_email(e), Ok(()), "{e}");
        }
    }

    #[test]
    fn invalid_emails() {
        for e in ["", "a@b", "no-at-sign.com", "@host.com", "user@nodot", "sp ace@host.com"] {
            assert_eq!(validate_email(e), Err(InvalidEmail), "{e}");
        }
    }
}
