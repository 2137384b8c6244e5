//! Tunnel wire protocol surface shared by both agents.
//!
//! Five HTTP endpoints, all GET, with short single-letter query parameters
//! carrying enciphered fields. The session capability token travels in a
//! request header on every call after creation. JSON envelopes always carry
//! `result: 1`; failures are plain HTTP error statuses.

use serde::{Deserialize, Serialize};

/// Request header carrying the session capability token.
pub const SESSION_TOKEN_HEADER: &str = "x-csrf-token";

/// Reserved response-header name carrying the numeric status code, so status
/// and headers share one ordered channel.
pub const STATUS_PSEUDO_HEADER: &str = "@@status_code";

/// CreateSession: no parameters, returns [`SessionReply`].
pub const CREATE_SESSION_PATH: &str = "/hello";
/// AddHeader: `x` = enciphered name, `y` = enciphered value.
pub const ADD_HEADER_PATH: &str = "/ai";
/// AddBodyChunk: `i` = chunk index, `j` = enciphered chunk.
pub const ADD_BODY_PATH: &str = "/ml";
/// Execute: `m` = enciphered method, `n` = enciphered url; replies with the
/// obfuscated response body as a `text/plain` stream.
pub const EXECUTE_PATH: &str = "/text";
/// GetResponseMeta: no parameters, returns [`MetaReply`].
pub const RESPONSE_META_PATH: &str = "/home";

/// Reply to CreateSession.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionReply {
    pub result: u8,
    /// The session id, used as the capability token from here on.
    pub token: String,
    /// The session secret, wrapped under the shared master key.
    pub data: String,
}

/// Acknowledgment reply to AddHeader and AddBodyChunk.
#[derive(Debug, Serialize, Deserialize)]
pub struct AckReply {
    pub result: u8,
    pub data: Vec<String>,
}

impl AckReply {
    pub(crate) fn ok() -> Self {
        Self {
            result: 1,
            data: Vec::new(),
        }
    }
}

/// Reply to GetResponseMeta.
#[derive(Debug, Serialize, Deserialize)]
pub struct MetaReply {
    pub result: u8,
    pub data: MetaPayload,
}

/// Status code plus enciphered response header pairs.
#[derive(Debug, Serialize, Deserialize)]
pub struct MetaPayload {
    /// Enciphered `(name, value)` pairs.
    pub x: Vec<(String, String)>,
    /// Numeric status code of the upstream response.
    pub i: u16,
}
