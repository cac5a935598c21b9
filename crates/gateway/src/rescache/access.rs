//! Access results and permission checks.

use crate::codec::AccessResult;
use crate::reserr::ResError;

/// Outcome of an access request: either a result or the error that
/// prevented one.
#[derive(Debug, Clone, PartialEq)]
pub struct Access {
    pub result: Option<AccessResult>,
    pub error: Option<ResError>,
}

impl Access {
    pub fn from_result(result: Result<AccessResult, ResError>) -> Self {
        match result {
            Ok(r) => Self {
                result: Some(r),
                error: None,
            },
            Err(e) => Self {
                result: None,
                error: Some(e),
            },
        }
    }

    /// Check whether the resource may be read.
    pub fn can_get(&self) -> Result<(), ResError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        match &self.result {
            Some(r) if r.get => Ok(()),
            _ => Err(ResError::access_denied()),
        }
    }

    /// Check whether `action` may be called. The `call` field is either `*`
    /// or a comma separated list of method names.
    pub fn can_call(&self, action: &str) -> Result<(), ResError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        let call = self.result.as_ref().map(|r| r.call.as_str()).unwrap_or("");
        if call == "*" || (!call.is_empty() && call.split(',').any(|m| m == action)) {
            return Ok(());
        }
        Err(ResError::access_denied())
    }
}
