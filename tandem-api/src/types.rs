//! Request and response bodies.

use serde::{Deserialize, Serialize};

use crate::extractors::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Fail,
}

/// Success envelope: `{"status":"success","request_id":..,"result":..}`.
///
/// Failures use the same shape through [`crate::ApiError`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub status: ResponseStatus,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
}

impl<T> Envelope<T> {
    pub fn success(request_id: RequestId, result: T) -> Self {
        Self {
            status: ResponseStatus::Success,
            request_id: request_id.to_string(),
            result: Some(result),
        }
    }
}

impl Envelope<()> {
    /// Success with no result body.
    pub fn done(request_id: RequestId) -> Self {
        Self {
            status: ResponseStatus::Success,
            request_id: request_id.to_string(),
            result: None,
        }
    }
}

/// Body of `PUT /api/v1/kv/:key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutValueRequest {
    pub value: String,
}

/// Query string of `GET /api/v1/kv`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub prefix: String,
}
