use std::fmt;

/// Datasites directory or journal missing; fatal, the loop aborts.
#[derive(Debug)]
pub struct SyncEnvironmentError(pub String);

impl SyncEnvironmentError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl fmt::Display for SyncEnvironmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sync environment error: {}", self.0)
    }
}

impl std::error::Error for SyncEnvironmentError {}

/// Unrecoverable inconsistency; fatal.
#[derive(Debug)]
pub struct FatalSyncError(pub String);

impl FatalSyncError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl fmt::Display for FatalSyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal sync error: {}", self.0)
    }
}

impl std::error::Error for FatalSyncError {}

/// Server rejected an action on a permission basis (HTTP 403). Triggers
/// the action's rejection reversal.
#[derive(Debug)]
pub struct SyftPermissionError(pub String);

impl fmt::Display for SyftPermissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "permission rejected: {}", self.0)
    }
}

impl std::error::Error for SyftPermissionError {}

/// Local or server size/content rule violation (e.g. HTTP 413). Retried
/// next cycle, but not reversed — the user must fix the underlying cause.
#[derive(Debug)]
pub struct SyncValidationError(pub String);

impl fmt::Display for SyncValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "validation error: {}", self.0)
    }
}

impl std::error::Error for SyncValidationError {}

/// HTTP status returned by the sync server's wire contract, carried so
/// callers can classify 403/413/5xx without re-parsing the response.
#[derive(Debug)]
pub struct HttpStatusError {
    pub status: u16,
    pub op: String,
}

impl fmt::Display for HttpStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} returned status {}", self.op, self.status)
    }
}

impl std::error::Error for HttpStatusError {}

impl HttpStatusError {
    pub fn is_permission_rejection(&self) -> bool {
        self.status == 403
    }

    pub fn is_validation_failure(&self) -> bool {
        self.status == 413
    }

    /// 5xx and the synthetic 0 used for transport-level failures are
    /// transient and should be retried rather than reversed.
    pub fn is_transient(&self) -> bool {
        self.status == 0 || self.status >= 500
    }
}

/// Classification of an executed action's outcome, used by the consumer
/// to decide whether to update the journal, reverse, retry, or abort.
pub enum Outcome {
    Success,
    PermissionRejected,
    ValidationFailed,
    Transient,
}

/// Inspects an `anyhow::Error` produced by a `SyncClient` call and
/// classifies it per §7 of the error taxonomy.
pub fn classify(err: &anyhow::Error) -> Outcome {
    if let Some(status_err) = err.downcast_ref::<HttpStatusError>() {
        if status_err.is_permission_rejection() {
            return Outcome::PermissionRejected;
        }
        if status_err.is_validation_failure() {
            return Outcome::ValidationFailed;
        }
        return Outcome::Transient;
    }
    if err.downcast_ref::<SyftPermissionError>().is_some() {
        return Outcome::PermissionRejected;
    }
    if err.downcast_ref::<SyncValidationError>().is_some() {
        return Outcome::ValidationFailed;
    }
    Outcome::Transient
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_403_classifies_as_permission_rejection() {
        let err: anyhow::Error = HttpStatusError {
            status: 403,
            op: "upload".into(),
        }
        .into();
        assert!(matches!(classify(&err), Outcome::PermissionRejected));
    }

    #[test]
    fn http_413_classifies_as_validation_failure() {
        let err: anyhow::Error = HttpStatusError {
            status: 413,
            op: "upload".into(),
        }
        .into();
        assert!(matches!(classify(&err), Outcome::ValidationFailed));
    }

    #[test]
    fn http_503_classifies_as_transient() {
        let err: anyhow::Error = HttpStatusError {
            status: 503,
            op: "upload".into(),
        }
        .into();
        assert!(matches!(classify(&err), Outcome::Transient));
    }

    #[test]
    fn plain_io_error_classifies_as_transient() {
        let err: anyhow::Error = anyhow::anyhow!("connection reset");
        assert!(matches!(classify(&err), Outcome::Transient));
    }
}
