//! An error from the priority balancer
use std::fmt;

/// An error from the priority balancer
#[derive(Debug)]
pub enum Error {
    /// A generic error with a message
    Generic(String),
    /// A node does not advertise allocatable capacity for a resource
    MissingAllocatable {
        /// The node that is missing capacity
        node: String,
        /// The resource that is missing
        resource: &'static str,
    },
    /// A balancing ratio outside of [0, 1]
    InvalidRatio(f64),
    /// A node does not have enough free memory to be balanced safely
    TooUtilized {
        /// The first node found without enough headroom
        node: String,
        /// The free memory on this node in bytes
        free_memory: u64,
        /// The free memory we need in bytes
        required: u64,
    },
    /// Creating a synthetic workload on a node failed
    Create {
        /// The node we were balancing
        node: String,
        /// The error that stopped us
        source: Box<Error>,
    },
    /// A bounded poll ran out of time
    Timeout {
        /// What we were waiting for
        waiting_for: String,
    },
    /// An IO Error
    IO(std::io::Error),
    /// An error from loading a config
    Config(config::ConfigError),
    /// An error from converting a value with serde
    Serde(serde_json::Error),
    /// An error from the k8s client
    K8s(kube::Error),
    /// An error from getting a k8s config
    K8sConfig(kube::config::KubeconfigError),
    /// An error from inferring a k8s config
    K8sInferConfig(kube::config::InferConfigError),
}

impl Error {
    /// Create a new generic error
    ///
    /// # Arguments
    ///
    /// * `msg` - The error message to set
    pub fn new<T: Into<String>>(msg: T) -> Self {
        Error::Generic(msg.into())
    }

    /// Get the HTTP status code from this error if one exists
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::K8s(kube::Error::Api(resp)) => Some(resp.code),
            Error::Create { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Whether this error means the balancing should be skipped instead of failed
    pub fn is_precondition(&self) -> bool {
        matches!(self, Error::TooUtilized { .. })
    }

    /// Get the error message for this error if one exists
    pub fn msg(&self) -> Option<String> {
        // get the msg from any error types that support it
        match self {
            Error::Generic(msg) => Some(msg.clone()),
            Error::MissingAllocatable { node, resource } => Some(format!(
                "node {node} does not advertise allocatable {resource}"
            )),
            Error::InvalidRatio(ratio) => Some(format!(
                "balancing ratio {ratio} must be a finite value within [0, 1]"
            )),
            Error::TooUtilized {
                node,
                free_memory,
                required,
            } => Some(format!(
                "node {node} only has {free_memory} bytes of free memory but {required} are required"
            )),
            Error::Create { node, source } => Some(format!(
                "failed to create balancing workload on {node}: {}",
                source.msg().unwrap_or_else(|| source.kind().to_owned())
            )),
            Error::Timeout { waiting_for } => Some(format!("timed out waiting for {waiting_for}")),
            Error::IO(err) => Some(err.to_string()),
            Error::Config(err) => Some(err.to_string()),
            Error::Serde(err) => Some(err.to_string()),
            Error::K8s(err) => Some(err.to_string()),
            Error::K8sConfig(err) => Some(err.to_string()),
            Error::K8sInferConfig(err) => Some(err.to_string()),
        }
    }

    /// get the kind of error as a str
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Generic(_) => "Generic",
            Error::MissingAllocatable { .. } => "MissingAllocatable",
            Error::InvalidRatio(_) => "InvalidRatio",
            Error::TooUtilized { .. } => "TooUtilized",
            Error::Create { .. } => "Create",
            Error::Timeout { .. } => "Timeout",
            Error::IO(_) => "IO",
            Error::Config(_) => "Config",
            Error::Serde(_) => "Serde",
            Error::K8s(_) => "K8s",
            Error::K8sConfig(_) => "K8sConf",
            Error::K8sInferConfig(_) => "K8sInferConf",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.msg() {
            Some(msg) => write!(f, "{}: {}", self.kind(), msg),
            None => write!(f, "{}", self.kind()),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IO(error)
    }
}

impl From<config::ConfigError> for Error {
    fn from(error: config::ConfigError) -> Self {
        Error::Config(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serde(error)
    }
}

impl From<kube::Error> for Error {
    fn from(error: kube::Error) -> Self {
        Error::K8s(error)
    }
}

impl From<kube::config::KubeconfigError> for Error {
    fn from(error: kube::config::KubeconfigError) -> Self {
        Error::K8sConfig(error)
    }
}

impl From<kube::config::InferConfigError> for Error {
    fn from(error: kube::config::InferConfigError) -> Self {
        Error::K8sInferConfig(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_errors_are_skippable() {
        let err = Error::TooUtilized {
            node: "node-a".into(),
            free_memory: 10,
            required: 20,
        };
        assert!(err.is_precondition());
        assert!(!Error::InvalidRatio(2.0).is_precondition());
        assert!(!Error::new("boom").is_precondition());
    }

    #[test]
    fn create_errors_wrap_their_source() {
        let err = Error::Create {
            node: "node-a".into(),
            source: Box::new(Error::new("quota exceeded")),
        };
        assert_eq!(err.kind(), "Create");
        assert_eq!(
            err.to_string(),
            "Create: failed to create balancing workload on node-a: quota exceeded"
        );
    }
}
