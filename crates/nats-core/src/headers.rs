//! Message headers
//!
//! Header block format:
//! ```text
//! NATS/1.0[ <status>[ <description>]]\r\n
//! Key: Value\r\n
//! ...
//! \r\n
//! ```

use crate::{Error, Result};

/// Header block version line
pub const HEADER_LINE: &str = "NATS/1.0";

/// Status sent by the server when a request has no responders
pub const NO_RESPONDERS_STATUS: u16 = 503;

pub const STATUS_HEADER: &str = "Status";
pub const DESCRIPTION_HEADER: &str = "Description";

/// Ordered, multi-valued message headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    status: Option<u16>,
    description: Option<String>,
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inline status code from the version line
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn set_status(&mut self, status: u16, description: Option<&str>) {
        self.status = Some(status);
        self.description = description.map(str::to_string);
    }

    /// Replace every value of `key` with `value`
    pub fn insert(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, values)) => {
                values.clear();
                values.push(value.to_string());
            }
            None => self.entries.push((key.to_string(), vec![value.to_string()])),
        }
    }

    /// Add `value` to the values of `key`
    pub fn append(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, values)) => values.push(value.to_string()),
            None => self.entries.push((key.to_string(), vec![value.to_string()])),
        }
    }

    /// First value of `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).and_then(|v| v.first()).map(String::as_str)
    }

    pub fn get_all(&self, key: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.status.is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Encode the block as sent in an `HPUB` frame
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::with_capacity(64);
        out.push_str(HEADER_LINE);
        if let Some(status) = self.status {
            out.push(' ');
            out.push_str(&status.to_string());
            if let Some(desc) = &self.description {
                out.push(' ');
                out.push_str(desc);
            }
        }
        out.push_str("\r\n");
        for (key, values) in &self.entries {
            for value in values {
                out.push_str(key);
                out.push_str(": ");
                out.push_str(value);
                out.push_str("\r\n");
            }
        }
        out.push_str("\r\n");
        out.into_bytes()
    }

    /// Decode a header block received in an `HMSG` frame
    pub fn parse(block: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(block)
            .map_err(|_| Error::InvalidHeader("header block is not valid UTF-8".into()))?;
        let mut lines = text.split("\r\n");

        let first = lines.next().unwrap_or_default();
        let rest = first
            .strip_prefix(HEADER_LINE)
            .ok_or_else(|| Error::InvalidHeader(format!("bad version line '{first}'")))?;

        let mut headers = HeaderMap::new();
        let rest = rest.trim();
        if !rest.is_empty() {
            let (code, desc) = match rest.split_once(char::is_whitespace) {
                Some((code, desc)) => (code, Some(desc.trim())),
                None => (rest, None),
            };
            let status = code
                .parse::<u16>()
                .map_err(|_| Error::InvalidHeader(format!("bad status '{code}'")))?;
            headers.set_status(status, desc.filter(|d| !d.is_empty()));
        }

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| Error::InvalidHeader(format!("bad header line '{line}'")))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::InvalidHeader(format!("empty key in '{line}'")));
            }
            headers.append(key, value.trim());
        }

        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_responders_block() {
        let headers = HeaderMap::parse(b"NATS/1.0 503\r\n\r\n").unwrap();
        assert_eq!(headers.status(), Some(NO_RESPONDERS_STATUS));
        assert!(headers.description().is_none());
        assert_eq!(headers.len(), 0);
    }

    #[test]
    fn test_status_with_description() {
        let headers = HeaderMap::parse(b"NATS/1.0 408 Request Timeout\r\n\r\n").unwrap();
        assert_eq!(headers.status(), Some(408));
        assert_eq!(headers.description(), Some("Request Timeout"));
    }
}
