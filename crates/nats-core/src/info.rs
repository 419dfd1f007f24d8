//! Greeting and handshake records
//!
//! The server opens every connection with `INFO <json>`; the client answers
//! with `CONNECT <json>`. Both payloads are JSON objects.

use serde::{Deserialize, Serialize};

use crate::{Error, Result, LANG, PROTOCOL_VERSION, VERSION};

/// Server greeting, also re-sent asynchronously on cluster topology changes
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    pub server_id: String,
    pub server_name: String,
    pub version: String,
    pub go: String,
    pub host: String,
    pub port: u16,
    pub proto: i32,
    pub max_payload: usize,
    pub auth_required: bool,
    pub tls_required: bool,
    pub tls_available: bool,
    pub headers: bool,
    pub connect_urls: Vec<String>,
    pub nonce: Option<String>,
    pub client_id: u64,
    pub client_ip: Option<String>,
    /// Lame duck mode: the server is about to shut down
    #[serde(rename = "ldm")]
    pub lame_duck_mode: bool,
}

impl ServerInfo {
    /// Decode the raw bytes that followed `INFO `
    pub fn parse(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| Error::InvalidInfo(e.to_string()))
    }
}

/// Handshake record sent in `CONNECT`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectInfo {
    pub verbose: bool,
    pub pedantic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    pub tls_required: bool,
    pub name: String,
    pub lang: String,
    pub version: String,
    pub protocol: u8,
    pub echo: bool,
    pub headers: bool,
    pub no_responders: bool,
}

impl Default for ConnectInfo {
    fn default() -> Self {
        Self {
            verbose: false,
            pedantic: false,
            user: None,
            pass: None,
            auth_token: None,
            jwt: None,
            nkey: None,
            sig: None,
            tls_required: false,
            name: String::new(),
            lang: LANG.to_string(),
            version: VERSION.to_string(),
            protocol: PROTOCOL_VERSION,
            echo: true,
            headers: true,
            no_responders: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_info() {
        let info = ServerInfo::parse(br#"{"server_id":"S1","max_payload":1048576}"#).unwrap();
        assert_eq!(info.server_id, "S1");
        assert_eq!(info.max_payload, 1_048_576);
        assert!(info.connect_urls.is_empty());
        assert!(!info.lame_duck_mode);
    }

    #[test]
    fn test_connect_omits_absent_credentials() {
        let json = serde_json::to_string(&ConnectInfo::default()).unwrap();
        assert!(!json.contains("\"user\""));
        assert!(!json.contains("\"auth_token\""));
        assert!(json.contains("\"lang\":\"rust\""));
    }
}
