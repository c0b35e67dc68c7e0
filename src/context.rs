use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use std::{
    collections::HashMap,
    net::IpAddr,
    time::Instant,
};

use crate::{
    audit::AuditOutcome,
    identity::Identity,
};

/// Everything known about one request as it moves through the pipeline.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
    pub started_at: Instant,
    pub identity: Option<Identity>,
    pub service: String,
    pub outcome: AuditOutcome,
    pub metadata: HashMap<String, String>,
}

impl RequestContext {
    pub fn new(
        request_id: String,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        client_ip: Option<IpAddr>,
    ) -> Self {
        Self {
            request_id,
            method,
            uri,
            headers,
            body: Bytes::new(),
            client_ip,
            started_at: Instant::now(),
            identity: None,
            service: String::new(),
            outcome: AuditOutcome::Forwarded,
            metadata: HashMap::new(),
        }
    }

    /// Resolved identity, or the anonymous address identity if resolution has
    /// not run.
    pub fn identity_or_anonymous(&self) -> Identity {
        self.identity
            .clone()
            .unwrap_or(Identity::Anonymous(self.client_ip))
    }
}
