//! The request/response descriptors exchanged with the API layer above this crate.
//!
//! Bodies are opaque serialized payloads, this crate never looks inside them.

use crate::communication::conversation::Conversation;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;

pub const SYSTEM_DATABASE: &str = "_system";

/// Request header that allows a follower to answer a read in an active failover deployment.
pub const ALLOW_DIRTY_READ_HEADER: &str = "x-arango-allow-dirty-read";

/// Response header set by an active failover follower that names the current leader.
pub const LEADER_ENDPOINT_HEADER: &str = "x-arango-endpoint";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Delete,
    Get,
    Post,
    Put,
    Head,
    Patch,
    Options,
}

impl RequestType {
    /// The numeric request type used in VelocyStream request headers.
    pub fn vst_code(self) -> i64 {
        match self {
            RequestType::Delete => 0,
            RequestType::Get => 1,
            RequestType::Post => 2,
            RequestType::Put => 3,
            RequestType::Head => 4,
            RequestType::Patch => 5,
            RequestType::Options => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::Delete => "DELETE",
            RequestType::Get => "GET",
            RequestType::Post => "POST",
            RequestType::Put => "PUT",
            RequestType::Head => "HEAD",
            RequestType::Patch => "PATCH",
            RequestType::Options => "OPTIONS",
        }
    }

    pub fn is_read(self) -> bool {
        matches!(
            self,
            RequestType::Get | RequestType::Head | RequestType::Options
        )
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArangoRequest {
    pub database: String,
    pub request_type: RequestType,
    pub path: String,
    pub query_params: BTreeMap<String, String>,
    pub header_params: BTreeMap<String, String>,
    pub body: Bytes,
    /// Permit a non leader to serve this request in an active failover deployment.
    pub allow_dirty_read: bool,
    /// Overrides the conversation bound to the current unit of work.
    pub conversation: Option<Conversation>,
}

impl ArangoRequest {
    pub fn new(
        database: impl Into<String>,
        request_type: RequestType,
        path: impl Into<String>,
    ) -> Self {
        ArangoRequest {
            database: database.into(),
            request_type,
            path: path.into(),
            query_params: BTreeMap::new(),
            header_params: BTreeMap::new(),
            body: Bytes::new(),
            allow_dirty_read: false,
            conversation: None,
        }
    }

    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(key.into(), value.into());
        self
    }

    pub fn with_header_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header_params.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_dirty_read(mut self, allow_dirty_read: bool) -> Self {
        self.allow_dirty_read = allow_dirty_read;
        self
    }

    pub fn with_conversation(mut self, conversation: Conversation) -> Self {
        self.conversation = Some(conversation);
        self
    }
}

#[derive(Clone, PartialEq)]
pub struct ArangoResponse {
    pub version: u8,
    pub response_code: u16,
    /// Header fields, names are lowercase.
    pub meta: BTreeMap<String, String>,
    pub body: Bytes,
}

impl ArangoResponse {
    pub fn new(response_code: u16) -> Self {
        ArangoResponse {
            version: 1,
            response_code,
            meta: BTreeMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.meta
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.response_code)
    }
}

impl fmt::Debug for ArangoResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArangoResponse")
            .field("version", &self.version)
            .field("response_code", &self.response_code)
            .field("meta", &self.meta)
            .field("body_len", &self.body.len())
            .finish()
    }
}
