//! Identifier generation and idempotency key composition.
//!
//! Generated ids are a millisecond timestamp plus a random alphanumeric
//! suffix. Their format is opaque: nothing parses them back, the optional prefix
//! exists only to make logs readable.

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;

const SUFFIX_LEN: usize = 12;

/// Separator used by [`compose_idempotency_key`].
pub const KEY_SEPARATOR: char = ':';

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(char::from)
        .collect()
}

/// Generate a correlation id, optionally prefixed (e.g. `"api"`, `"ws"`).
///
/// # Example
///
/// ```
/// use idempotency_core::generate_correlation_id;
///
/// let id = generate_correlation_id(Some("api"));
/// assert!(id.starts_with("api-"));
/// assert_ne!(id, generate_correlation_id(Some("api")));
/// ```
#[must_use]
pub fn generate_correlation_id(prefix: Option<&str>) -> String {
    let prefix = prefix.filter(|p| !p.is_empty()).unwrap_or("corr");
    format!(
        "{prefix}-{}-{}",
        Utc::now().timestamp_millis(),
        random_suffix()
    )
}

/// Generate a message id.
#[must_use]
pub fn generate_message_id() -> String {
    format!("msg-{}-{}", Utc::now().timestamp_millis(), random_suffix())
}

/// Deterministically join the non-empty parts of a key.
///
/// Uniqueness across unrelated operations is the caller's responsibility; the
/// usual convention is to lead with an operation name.
///
/// # Example
///
/// ```
/// use idempotency_core::compose_idempotency_key;
///
/// assert_eq!(
///     compose_idempotency_key(["confirm-reservation", "r-42", "", "user-7"]),
///     "confirm-reservation:r-42:user-7"
/// );
/// ```
#[must_use]
pub fn compose_idempotency_key<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut key = String::new();
    for part in parts {
        let part = part.as_ref();
        if part.is_empty() {
            continue;
        }
        if !key.is_empty() {
            key.push(KEY_SEPARATOR);
        }
        key.push_str(part);
    }
    key
}
