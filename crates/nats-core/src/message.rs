//! Message type

use bytes::Bytes;

use crate::headers::NO_RESPONDERS_STATUS;
use crate::{HeaderMap, MsgEvent, Result};

/// A message published to, or received from, a subject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: Option<HeaderMap>,
    pub payload: Bytes,
    /// Subscription that received the message (0 for outbound messages)
    pub sid: u64,
    header_len: usize,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            headers: None,
            payload: payload.into(),
            sid: 0,
            header_len: 0,
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.header_len = headers.encode().len();
        self.headers = Some(headers);
        self
    }

    /// Build a message from a parsed `MSG`/`HMSG` event
    pub fn from_event(event: MsgEvent) -> Result<Self> {
        let (headers, header_len) = match &event.headers {
            Some(block) => (Some(HeaderMap::parse(block)?), block.len()),
            None => (None, 0),
        };
        Ok(Self {
            subject: event.subject,
            reply: event.reply,
            headers,
            payload: event.payload,
            sid: event.sid,
            header_len,
        })
    }

    /// Bytes counted against pending limits: header block plus payload
    pub fn size(&self) -> usize {
        self.header_len + self.payload.len()
    }

    /// Whether this is the server's "no responders" status reply
    pub fn is_no_responders(&self) -> bool {
        self.payload.is_empty()
            && self
                .headers
                .as_ref()
                .and_then(HeaderMap::status)
                .is_some_and(|s| s == NO_RESPONDERS_STATUS)
    }
}
