use axum::{
    body::Body,
    response::Response,
};
use bytes::Bytes;
use http::{
    HeaderMap,
    HeaderValue,
    header::{self, HeaderName},
};
use serde_json::value::RawValue;
use std::{
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

use crate::{
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    router::RouteTable,
};

const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Forwards admitted requests to the backend owning the matched prefix and
/// relays the reply. Never retries.
pub struct Dispatcher {
    client: reqwest::Client,
    routes: Arc<RouteTable>,
}

impl Dispatcher {
    pub fn new(routes: Arc<RouteTable>) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        Ok(Self { client, routes })
    }

    pub async fn dispatch(&self, ctx: &RequestContext) -> GatewayResult<Response<Body>> {
        let route = self
            .routes
            .resolve(ctx.uri.path())
            .ok_or(GatewayError::RouteNotFound)?;

        if !route.allows(&ctx.method, ctx.uri.path()) {
            return Err(GatewayError::MethodNotAllowed {
                allowed: route.methods_for(ctx.uri.path()).to_vec(),
            });
        }

        let target_url = route.target_url(&ctx.uri);
        let body = prepare_body(&ctx.headers, &ctx.body);

        let mut headers = forwarded_headers(&ctx.headers);
        if !headers.contains_key(header::TRANSFER_ENCODING)
            && (!body.is_empty() || headers.contains_key(header::CONTENT_LENGTH))
        {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        }
        if !headers.contains_key(&REQUEST_ID)
            && let Ok(value) = HeaderValue::from_str(&ctx.request_id)
        {
            headers.insert(REQUEST_ID, value);
        }

        let started = Instant::now();
        let result = self
            .client
            .request(ctx.method.clone(), &target_url)
            .headers(headers)
            .body(body)
            .timeout(route.timeout)
            .send()
            .await;

        let upstream_response = match result {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    service = %route.service,
                    url = %target_url,
                    timeout = err.is_timeout(),
                    error = %err,
                    "upstream call failed"
                );
                return Err(err.into());
            }
        };

        let status = upstream_response.status();
        let upstream_headers = upstream_response.headers().clone();
        let body = upstream_response.bytes().await.map_err(|err| {
            tracing::warn!(
                request_id = %ctx.request_id,
                service = %route.service,
                error = %err,
                "failed to read upstream body"
            );
            GatewayError::from(err)
        })?;

        // Still encoded only when the backend picked an encoding the client
        // asked for but this client cannot decode; relayed as-is.
        let encoded = upstream_headers.contains_key(header::CONTENT_ENCODING);
        if !encoded && !is_well_formed_json(&body) {
            tracing::warn!(
                request_id = %ctx.request_id,
                service = %route.service,
                status = %status,
                "upstream returned a body that is not JSON"
            );
            return Err(GatewayError::InvalidUpstreamResponse);
        }

        tracing::debug!(
            request_id = %ctx.request_id,
            service = %route.service,
            status = %status,
            latency_ms = started.elapsed().as_millis() as u64,
            "upstream replied"
        );

        let mut builder = Response::builder().status(status);
        for (name, value) in &upstream_headers {
            if should_relay_response_header(name) {
                builder = builder.header(name, value);
            }
        }

        builder
            .body(Body::from(body))
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }
}

/// Inbound headers minus `host`. Header names are case-insensitive, so every
/// spelling of `Host` is dropped and nothing else is touched.
pub fn forwarded_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if *name != header::HOST {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// JSON bodies are validated and forwarded byte-for-byte; malformed JSON is
/// replaced with a `null` payload. Empty bodies and other content types pass
/// through untouched.
pub fn prepare_body(headers: &HeaderMap, body: &Bytes) -> Bytes {
    if body.is_empty() || !is_json_content(headers) {
        return body.clone();
    }

    match serde_json::from_slice::<&RawValue>(body) {
        Ok(_) => body.clone(),
        Err(_) => Bytes::from_static(b"null"),
    }
}

fn is_json_content(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|mime| {
            let mime = mime.trim().to_ascii_lowercase();
            mime == "application/json" || mime.ends_with("+json")
        })
        .unwrap_or(false)
}

fn is_well_formed_json(body: &Bytes) -> bool {
    if body.iter().all(u8::is_ascii_whitespace) {
        return true;
    }
    serde_json::from_slice::<&RawValue>(body).is_ok()
}

fn should_relay_response_header(name: &HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_host_is_filtered() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_bytes(b"Host").unwrap(),
            HeaderValue::from_static("gateway:5000"),
        );
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        headers.insert(
            HeaderName::from_bytes(b"X-Custom-Thing").unwrap(),
            HeaderValue::from_static("Mixed Case Value"),
        );
        headers.append(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers.append(header::ACCEPT, HeaderValue::from_static("text/plain"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));

        let forwarded = forwarded_headers(&headers);

        assert!(!forwarded.contains_key("host"));
        assert!(!forwarded.contains_key("HOST"));
        assert_eq!(forwarded.len(), headers.len() - 1);
        assert_eq!(forwarded["x-custom-thing"], "Mixed Case Value");
        assert_eq!(forwarded["authorization"], "Bearer abc");
        assert_eq!(forwarded.get_all(header::ACCEPT).iter().count(), 2);
        assert_eq!(forwarded[header::CONNECTION], "keep-alive");
    }

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        headers
    }

    #[test]
    fn json_body_is_forwarded_unchanged() {
        let raw = r#"{"b": 1.50, "a": [1e400, "é"], "n": 12345678901234567890123}"#;
        let body = Bytes::from_static(raw.as_bytes());
        assert_eq!(prepare_body(&json_headers(), &body), body);
    }

    #[test]
    fn malformed_json_becomes_null() {
        let body = Bytes::from_static(b"{\"username\": ");
        assert_eq!(prepare_body(&json_headers(), &body), Bytes::from_static(b"null"));
        assert_eq!(
            prepare_body(&json_headers(), &Bytes::from_static(b"  ")),
            Bytes::from_static(b"null")
        );
    }

    #[test]
    fn empty_json_body_stays_empty() {
        assert!(prepare_body(&json_headers(), &Bytes::new()).is_empty());
    }

    #[test]
    fn non_json_body_is_opaque() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let body = Bytes::from_static(b"{not json either");
        assert_eq!(prepare_body(&headers, &body), body);
        assert_eq!(prepare_body(&HeaderMap::new(), &body), body);
    }

    #[test]
    fn vendor_json_types_are_recognized() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        assert_eq!(
            prepare_body(&headers, &Bytes::from_static(b"nope")),
            Bytes::from_static(b"null")
        );
    }

    #[test]
    fn upstream_body_well_formedness() {
        assert!(is_well_formed_json(&Bytes::new()));
        assert!(is_well_formed_json(&Bytes::from_static(b"{\"error\":\"not found\"}")));
        assert!(!is_well_formed_json(&Bytes::from_static(b"<html>oops</html>")));
    }
}
