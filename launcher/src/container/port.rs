//! Parser for the runtime's published-port output
//!
//! Grammar of one mapping line:
//!
//! ```text
//! <containerPort> "/" <proto> " -> " <host> ":" <port>
//! ```
//!
//! `<host>` may be a bracketed IPv6 literal (`[::]:32768`).

use crate::error::PortParseError;

/// One published port mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: u16,
    pub protocol: String,
    pub host: String,
    pub port: u16,
}

impl PortMapping {
    /// Whether the mapping is bound on every interface
    pub fn is_wildcard(&self) -> bool {
        matches!(self.host.as_str(), "0.0.0.0" | "::" | "[::]" | "")
    }
}

/// Parse the first mapping line of the port query output
pub fn parse_port_mapping(output: &str) -> Result<PortMapping, PortParseError> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or(PortParseError::Empty)?;

    let (container_side, host_side) = line
        .split_once(" -> ")
        .ok_or_else(|| PortParseError::MissingArrow(line.to_string()))?;

    let (container_port, protocol) = container_side
        .trim()
        .split_once('/')
        .ok_or_else(|| PortParseError::MissingProtocol(line.to_string()))?;
    if protocol.is_empty() {
        return Err(PortParseError::MissingProtocol(line.to_string()));
    }

    let (host, port) = host_side
        .trim()
        .rsplit_once(':')
        .ok_or_else(|| PortParseError::MissingHostPort(line.to_string()))?;

    Ok(PortMapping {
        container_port: parse_port(container_port)?,
        protocol: protocol.to_string(),
        host: host.to_string(),
        port: parse_port(port)?,
    })
}

fn parse_port(value: &str) -> Result<u16, PortParseError> {
    match value.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(PortParseError::InvalidPort(value.to_string())),
    }
}
