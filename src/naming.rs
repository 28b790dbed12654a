//! Name validation and identifier helpers shared by queues and managers.
//!
//! Queue, exchange, and topic leaf names all follow the same dotted
//! lowercase pattern so that one name can address the equivalent resource
//! on either broker family.

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::error::{MqError, Result};

/// Pattern every queue/exchange/topic leaf name must match.
static QUEUE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_-]+(\.[a-z0-9_-]+)*$").expect("valid pattern"));

/// Validate a queue/exchange/topic leaf name.
pub(crate) fn validate_queue_name(name: &str) -> Result<()> {
    if QUEUE_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(MqError::invalid_argument(format!(
            "queue name `{name}` must match `^[a-z0-9_-]+(\\.[a-z0-9_-]+)*$`"
        )))
    }
}

/// Random lowercase hex identifier of `len` characters (len <= 32).
pub(crate) fn random_id(len: usize) -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(len);
    id
}
