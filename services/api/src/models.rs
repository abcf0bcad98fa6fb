//! API Models
//!
//! Response bodies for the HTTP surface, annotated for OpenAPI generation with `utoipa`.

use callrelay_core::transcript::Turn;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub message: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
    /// Relay connections currently terminated by this process.
    pub open_connections: usize,
}

/// The stored conversation for one call.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct SessionRecord {
    #[schema(example = "CA123456789abcdef123456789abcdef12")]
    pub call_sid: String,
    /// Turns in order; the first is always the system instruction.
    #[schema(value_type = Vec<Object>)]
    pub conversation: Vec<Turn>,
}
