//! Inbox subjects and request tokens

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of the unique part of an inbox
const INBOX_TOKEN_LEN: usize = 22;

/// Length of the per-request token appended to a shared reply prefix
pub(crate) const REQUEST_TOKEN_LEN: usize = 8;

/// Random alphanumeric token
pub(crate) fn unique_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// `<prefix>.<unique>`, a subject only this client listens on
pub fn new_inbox(prefix: &str) -> String {
    format!("{}.{}", prefix, unique_token(INBOX_TOKEN_LEN))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbox_shape() {
        let inbox = new_inbox("_INBOX");
        let (prefix, token) = inbox.split_once('.').unwrap();
        assert_eq!(prefix, "_INBOX");
        assert_eq!(token.len(), INBOX_TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_inboxes_differ() {
        assert_ne!(new_inbox("_INBOX"), new_inbox("_INBOX"));
    }
}
