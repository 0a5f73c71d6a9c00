//! Result type alias for KENSA operations

use crate::error::KensaError;

/// Standard Result type for KENSA operations
pub type Result<T> = std::result::Result<T, KensaError>;
