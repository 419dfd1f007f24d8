//! Outbound command encoding
//!
//! Every writer appends one complete CRLF-terminated frame to a [`Buffer`],
//! so frames are never interleaved when the buffer is shared behind a lock.

use crate::{Buffer, ConnectInfo, Error, Result};

pub const CRLF: &[u8] = b"\r\n";
pub const PING: &[u8] = b"PING\r\n";
pub const PONG: &[u8] = b"PONG\r\n";

/// Operation keywords
pub mod op {
    pub const CONNECT: &[u8] = b"CONNECT ";
    pub const PUB: &[u8] = b"PUB ";
    pub const HPUB: &[u8] = b"HPUB ";
    pub const SUB: &[u8] = b"SUB ";
    pub const UNSUB: &[u8] = b"UNSUB ";
}

// ============================================================================
// VALIDATION
// ============================================================================

/// Check a subject before it goes on the wire.
///
/// Subjects are non-empty, contain no whitespace and have no empty tokens.
pub fn validate_subject(subject: &str) -> Result<()> {
    if subject.is_empty()
        || subject.bytes().any(|b| b.is_ascii_whitespace())
        || subject.split('.').any(str::is_empty)
    {
        return Err(Error::InvalidSubject(subject.to_string()));
    }
    Ok(())
}

/// Queue group names follow the same rules as a single subject token set
pub fn validate_queue(queue: &str) -> Result<()> {
    if queue.is_empty() || queue.bytes().any(|b| b.is_ascii_whitespace()) {
        return Err(Error::InvalidSubject(queue.to_string()));
    }
    Ok(())
}

// ============================================================================
// ENCODERS
// ============================================================================

/// `CONNECT {json}\r\n`
pub fn write_connect(buf: &mut Buffer<'_>, info: &ConnectInfo) -> Result<()> {
    let json = serde_json::to_vec(info)?;
    buf.append(op::CONNECT);
    buf.append(&json);
    buf.append(CRLF);
    Ok(())
}

pub fn write_ping(buf: &mut Buffer<'_>) {
    buf.append(PING);
}

pub fn write_pong(buf: &mut Buffer<'_>) {
    buf.append(PONG);
}

/// `PUB <subject> [reply] <len>\r\n<payload>\r\n`
pub fn write_pub(buf: &mut Buffer<'_>, subject: &str, reply: Option<&str>, payload: &[u8]) {
    buf.append(op::PUB);
    buf.append(subject.as_bytes());
    if let Some(reply) = reply {
        buf.append_byte(b' ');
        buf.append(reply.as_bytes());
    }
    buf.append_byte(b' ');
    buf.append(payload.len().to_string().as_bytes());
    buf.append(CRLF);
    buf.append(payload);
    buf.append(CRLF);
}

/// `HPUB <subject> [reply] <hdrlen> <totallen>\r\n<headers><payload>\r\n`
pub fn write_hpub(
    buf: &mut Buffer<'_>,
    subject: &str,
    reply: Option<&str>,
    headers: &[u8],
    payload: &[u8],
) {
    buf.append(op::HPUB);
    buf.append(subject.as_bytes());
    if let Some(reply) = reply {
        buf.append_byte(b' ');
        buf.append(reply.as_bytes());
    }
    buf.append_byte(b' ');
    buf.append(headers.len().to_string().as_bytes());
    buf.append_byte(b' ');
    buf.append((headers.len() + payload.len()).to_string().as_bytes());
    buf.append(CRLF);
    buf.append(headers);
    buf.append(payload);
    buf.append(CRLF);
}

/// `SUB <subject> [queue] <sid>\r\n`
pub fn write_sub(buf: &mut Buffer<'_>, subject: &str, queue: Option<&str>, sid: u64) {
    buf.append(op::SUB);
    buf.append(subject.as_bytes());
    if let Some(queue) = queue {
        buf.append_byte(b' ');
        buf.append(queue.as_bytes());
    }
    buf.append_byte(b' ');
    buf.append(sid.to_string().as_bytes());
    buf.append(CRLF);
}

/// `UNSUB <sid> [max]\r\n`
pub fn write_unsub(buf: &mut Buffer<'_>, sid: u64, max: Option<u64>) {
    buf.append(op::UNSUB);
    buf.append(sid.to_string().as_bytes());
    if let Some(max) = max {
        buf.append_byte(b' ');
        buf.append(max.to_string().as_bytes());
    }
    buf.append(CRLF);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pub_frame() {
        let mut buf = Buffer::new();
        write_pub(&mut buf, "foo", Some("bar"), b"hello");
        assert_eq!(buf.data(), b"PUB foo bar 5\r\nhello\r\n");
    }

    #[test]
    fn test_hpub_lengths() {
        let mut buf = Buffer::new();
        write_hpub(&mut buf, "foo", None, b"NATS/1.0\r\n\r\n", b"hi");
        assert_eq!(buf.data(), b"HPUB foo 12 14\r\nNATS/1.0\r\n\r\nhi\r\n");
    }

    #[test]
    fn test_sub_and_unsub() {
        let mut buf = Buffer::new();
        write_sub(&mut buf, "foo.*", Some("workers"), 7);
        write_unsub(&mut buf, 7, Some(3));
        assert_eq!(buf.data(), b"SUB foo.* workers 7\r\nUNSUB 7 3\r\n");
    }

    #[test]
    fn test_subject_validation() {
        assert!(validate_subject("foo.bar.>").is_ok());
        assert!(validate_subject("").is_err());
        assert!(validate_subject("foo..bar").is_err());
        assert!(validate_subject("foo bar").is_err());
        assert!(validate_subject(".foo").is_err());
    }
}
