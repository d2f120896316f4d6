//! Request identification.
//!
//! `SetRequestIdLayer` stamps every request with an `x-request-id` header
//! (UUID v4) unless the client sent one. Handlers reuse it as the ID of the
//! suspended request so logs on both sides line up.

use axum::http::HeaderMap;

use crate::suspend::RequestId;

/// Header carrying the request ID.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Request ID from the headers, or a fresh one if absent or not a UUID.
pub fn request_id(headers: &HeaderMap) -> RequestId {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn reuses_uuid_header() {
        let id = RequestId::new();
        let mut headers = HeaderMap::new();
        headers.insert(X_REQUEST_ID, HeaderValue::from_str(&id.to_string()).unwrap());
        assert_eq!(request_id(&headers), id);
    }

    #[test]
    fn generates_when_missing_or_malformed() {
        let mut headers = HeaderMap::new();
        let a = request_id(&headers);
        headers.insert(X_REQUEST_ID, HeaderValue::from_static("client-42"));
        let b = request_id(&headers);
        assert_ne!(a, b);
    }
}
