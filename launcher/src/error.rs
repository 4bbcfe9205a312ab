//! Launch error types
//!
//! Every stage of a launch reports failure through [`LaunchError`], tagged by
//! the stage that failed.

use std::time::Duration;

use thiserror::Error;

/// Failure of a session launch
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid launch request: {0}")]
    Request(#[from] RequestError),

    #[error("Broker provisioning failed: {0}")]
    Broker(#[from] BrokerError),

    #[error("Container runtime failed: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Unexpected port mapping output: {0}")]
    Parse(#[from] PortParseError),
}

impl LaunchError {
    /// Stable label of the failed stage, used in logs and metrics
    pub fn stage(&self) -> &'static str {
        match self {
            LaunchError::Config(_) => "config",
            LaunchError::Request(_) => "request",
            LaunchError::Broker(_) => "broker",
            LaunchError::Runtime(_) => "runtime",
            LaunchError::Parse(_) => "parse",
        }
    }
}

/// Malformed launch request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    #[error("runtime host '{0}' has no usable hostname")]
    InvalidRuntimeHost(String),
}

/// Broker subscription provisioning failure
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("cannot connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("cannot declare exchange '{exchange}': {reason}")]
    DeclareExchange { exchange: String, reason: String },

    #[error("cannot close broker connection: {0}")]
    Disconnect(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

/// Container runtime invocation failure
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with {}: {stderr}", exit_code_label(.code))]
    Exit {
        command: &'static str,
        code: Option<i32>,
        stderr: String,
    },

    #[error("container run printed no container id")]
    MissingContainerId,

    #[error("'{command}' timed out after {after:?}")]
    Timeout {
        command: &'static str,
        after: Duration,
    },
}

fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

/// Port mapping output that does not follow
/// `<containerPort>/<proto> -> <host>:<port>`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortParseError {
    #[error("no port mapping in runtime output")]
    Empty,

    #[error("missing '/<proto>' after container port in '{0}'")]
    MissingProtocol(String),

    #[error("missing ' -> ' separator in '{0}'")]
    MissingArrow(String),

    #[error("missing ':<port>' after host in '{0}'")]
    MissingHostPort(String),

    #[error("invalid port '{0}'")]
    InvalidPort(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_labels() {
        let err: LaunchError = RequestError::MissingFields(vec!["user"]).into();
        assert_eq!(err.stage(), "request");

        let err: LaunchError = PortParseError::Empty.into();
        assert_eq!(err.stage(), "parse");

        let err: LaunchError = RuntimeError::MissingContainerId.into();
        assert_eq!(err.stage(), "runtime");
    }

    #[test]
    fn test_error_messages() {
        let err = RequestError::MissingFields(vec!["user", "card"]);
        assert_eq!(err.to_string(), "missing required fields: user, card");

        let err = RuntimeError::Exit {
            command: "run",
            code: Some(125),
            stderr: "no such image".to_string(),
        };
        assert_eq!(err.to_string(), "'run' exited with status 125: no such image");
    }
}
