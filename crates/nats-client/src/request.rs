//! Request/reply
//!
//! Replies for all requests of a connection share a small pool of wildcard
//! inbox subscriptions (`<inbox>.*`). Each request picks a random token as
//! the last reply subject token and waits on its own completion slot,
//! resolved by the reader thread when the reply arrives.

use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use nats_core::{HeaderMap, Message};

use crate::connection::ConnInner;
use crate::inbox::{self, REQUEST_TOKEN_LEN};
use crate::subscription::{Delivery, MsgHandler};
use crate::sync::Completion;
use crate::{Error, Result};

/// Reply subscriptions shared by the requests of a connection
#[derive(Debug, Default)]
pub(crate) struct RespMux {
    prefixes: Vec<String>,
    next: usize,
}

impl RespMux {
    pub(crate) fn clear(&mut self) {
        self.prefixes.clear();
        self.next = 0;
    }
}

impl ConnInner {
    /// Inbox prefix for the next request, creating the reply
    /// subscriptions on first use
    fn reply_prefix(self: &Arc<Self>) -> Result<String> {
        let mut mux = self.resp_mux.lock();
        if mux.prefixes.len() < self.opts.resp_mux_pool_size {
            let prefix = inbox::new_inbox(&self.opts.inbox_prefix);
            let conn = Arc::downgrade(self);
            let handler: MsgHandler = Arc::new(move |msg| {
                if let Some(inner) = conn.upgrade() {
                    inner.resolve_request(msg);
                }
            });
            self.subscribe(&format!("{}.*", prefix), None, Delivery::Internal(handler), None)?;
            mux.prefixes.push(prefix.clone());
            return Ok(prefix);
        }
        let idx = mux.next % mux.prefixes.len();
        mux.next = mux.next.wrapping_add(1);
        Ok(mux.prefixes[idx].clone())
    }

    fn resolve_request(&self, msg: Message) {
        let token = msg.subject.rsplit('.').next().unwrap_or_default();
        match self.requests.remove(token) {
            Some((_, waiter)) => {
                let result = if msg.is_no_responders() {
                    Err(Error::NoResponders)
                } else {
                    Ok(msg)
                };
                waiter.complete(result);
            }
            None => trace!("Late or unknown reply on '{}'", msg.subject),
        }
    }

    pub(crate) fn request(
        self: &Arc<Self>,
        subject: &str,
        headers: Option<&HeaderMap>,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Message> {
        if self.opts.use_old_request_style {
            return self.old_request(subject, headers, payload, timeout);
        }

        let prefix = self.reply_prefix()?;
        let waiter = Arc::new(Completion::new());
        let token = loop {
            let token = inbox::unique_token(REQUEST_TOKEN_LEN);
            if let Entry::Vacant(slot) = self.requests.entry(token.clone()) {
                slot.insert(waiter.clone());
                break token;
            }
        };

        let reply = format!("{}.{}", prefix, token);
        if let Err(e) = self.publish(subject, Some(&reply), headers, payload) {
            self.requests.remove(&token);
            return Err(e);
        }

        let result = waiter.wait(timeout);
        self.requests.remove(&token);
        result.unwrap_or(Err(Error::Timeout))
    }

    /// One inbox subscription per request
    fn old_request(
        self: &Arc<Self>,
        subject: &str,
        headers: Option<&HeaderMap>,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Message> {
        let inbox = inbox::new_inbox(&self.opts.inbox_prefix);
        let sub = self.subscribe(&inbox, None, Delivery::Sync, None)?;
        let result = self
            .auto_unsubscribe(&sub, 1)
            .and_then(|()| self.publish(subject, Some(&inbox), headers, payload))
            .and_then(|()| sub.next_message(timeout));
        if result.is_err() {
            let _ = self.unsubscribe(&sub);
        }
        match result {
            Ok(msg) if msg.is_no_responders() => Err(Error::NoResponders),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resp_mux_clear() {
        let mut mux = RespMux {
            prefixes: vec!["_INBOX.abc".into()],
            next: 3,
        };
        mux.clear();
        assert!(mux.prefixes.is_empty());
        assert_eq!(mux.next, 0);
    }
}
