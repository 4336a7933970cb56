use std::fmt;

/// Error taxonomy for the controller.
///
/// The reconcile loop classifies these by kind: `Config` and `Template` are
/// fatal at startup, `Render`/`Io`/`Cloud` are retryable per change,
/// `Reload` and DNS batch failures are soft (the next tick retries), and
/// `CloudInvariant` is surfaced on every tick until an operator resolves it.
#[derive(Debug)]
pub enum ControllerError {
    Config(String),
    Template(String),
    Render(String),
    Io(std::io::Error),
    Kube(kube::Error),
    Cloud(String),
    CloudInvariant(String),
    Reload(String),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::Config(msg) => write!(f, "config error: {}", msg),
            ControllerError::Template(msg) => write!(f, "template parse error: {}", msg),
            ControllerError::Render(msg) => write!(f, "template render error: {}", msg),
            ControllerError::Io(e) => write!(f, "io error: {}", e),
            ControllerError::Kube(e) => write!(f, "kubernetes error: {}", e),
            ControllerError::Cloud(msg) => write!(f, "cloud error: {}", msg),
            ControllerError::CloudInvariant(msg) => write!(f, "cloud invariant violated: {}", msg),
            ControllerError::Reload(msg) => write!(f, "reload error: {}", msg),
        }
    }
}

impl std::error::Error for ControllerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ControllerError::Io(e) => Some(e),
            ControllerError::Kube(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ControllerError {
    fn from(e: std::io::Error) -> Self {
        ControllerError::Io(e)
    }
}

impl From<kube::Error> for ControllerError {
    fn from(e: kube::Error) -> Self {
        ControllerError::Kube(e)
    }
}
