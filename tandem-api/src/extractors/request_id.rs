//! Request id extractor.
//!
//! Clients may correlate requests by sending an `x-request-id` UUID. A
//! request without one gets a fresh v4 id; a request with a malformed one is
//! rejected before the handler runs.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use std::fmt;
use uuid::Uuid;

use crate::error::ApiError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Parse the header value, or mint a new id when it is absent.
    pub fn from_header(value: Option<&str>) -> Result<Self, ApiError> {
        match value {
            None => Ok(RequestId(Uuid::new_v4())),
            Some(raw) => Uuid::parse_str(raw.trim())
                .map(RequestId)
                .map_err(|_| ApiError::invalid_request_id()),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = match parts.headers.get(REQUEST_ID_HEADER) {
            Some(value) => Some(value.to_str().map_err(|_| ApiError::invalid_request_id())?),
            None => None,
        };
        let id = RequestId::from_header(header)?;
        tracing::Span::current().record("request_id", tracing::field::display(&id));
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_missing_header_mints_v4() {
        let id = RequestId::from_header(None).unwrap();
        assert_eq!(id.0.get_version_num(), 4);
    }

    #[test]
    fn test_valid_header_is_kept() {
        let raw = "6f1c2a4e-8d3b-4c2a-9f1e-2b3c4d5e6f70";
        assert_eq!(RequestId::from_header(Some(raw)).unwrap().to_string(), raw);
    }

    #[test]
    fn test_malformed_header_is_rejected() {
        let err = RequestId::from_header(Some("not-a-uuid")).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequestId);
        assert_eq!(err.message, "Invalid Request-Id");
    }
}
