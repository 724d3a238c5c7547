//! Broker-level error taxonomy.
//!
//! Pipeline failures travel as `FailureReason` values inside
//! `RawRecognitionResult`; only errors the caller of the broker can
//! act on surface here.

use thiserror::Error;
use uuid::Uuid;

use crate::domain::Modality;

/// Errors returned from the capture broker API
#[derive(Debug, Error)]
pub enum CaptureError {
    /// A capture is already outstanding for this modality
    #[error("capture already active for modality: {0}")]
    Busy(Modality),

    /// Cancel of a request the broker does not know about
    #[error("no outstanding capture request with id {0}")]
    NotFound(Uuid),
}
