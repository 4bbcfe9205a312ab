//! Data models for the AppVM launcher
//!
//! This module defines the launch request received from the dispatch service,
//! the connectivity descriptor returned to it, and the session secret.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::RequestError;

// ============================================================================
// Launch Request
// ============================================================================

/// Application command: the application identifier followed by its arguments,
/// e.g. `["writer", "report.odt"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplicationCommand(Vec<String>);

impl ApplicationCommand {
    pub fn new(parts: Vec<String>) -> Option<Self> {
        match parts.first() {
            Some(first) if !first.trim().is_empty() => Some(Self(parts)),
            _ => None,
        }
    }

    /// Primary application identifier
    pub fn application(&self) -> &str {
        &self.0[0]
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

/// A boolean-ish flag as sent by the dispatch service: either a JSON boolean
/// or a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Text(String),
}

impl FlagValue {
    /// Whether the flag is set: `true`, or any non-empty string other than `"false"`.
    pub fn is_set(&self) -> bool {
        match self {
            FlagValue::Bool(b) => *b,
            FlagValue::Text(s) => !s.is_empty() && s != "false",
        }
    }

    /// Value as forwarded into the container environment
    pub fn as_env(&self) -> String {
        match self {
            FlagValue::Bool(b) => b.to_string(),
            FlagValue::Text(s) => s.clone(),
        }
    }
}

/// Broker connection overrides carried by a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub login: Option<String>,
    pub password: Option<String>,
}

/// Database connection parameters forwarded to the application
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseParams {
    pub host: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub name: Option<String>,
}

/// Remote container-host topology override
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeHostOverride {
    /// Runtime endpoint, e.g. `tcp://10.0.0.5:2376` or `unix:///var/run/docker.sock`
    pub host: Option<String>,
    pub tls_verify: Option<String>,
    pub machine_name: Option<String>,
}

impl RuntimeHostOverride {
    /// Remote runtime endpoint, if the override points at a non-unix-socket host
    pub fn remote_host(&self) -> Option<&str> {
        self.host
            .as_deref()
            .filter(|host| !host.is_empty() && !host.starts_with("unix://"))
    }

    /// Environment passed to runtime invocations that target this host
    pub fn env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(host) = &self.host {
            env.insert("DOCKER_HOST".to_string(), host.clone());
        }
        if let Some(tls) = &self.tls_verify {
            env.insert("DOCKER_TLS_VERIFY".to_string(), tls.clone());
        }
        if let Some(name) = &self.machine_name {
            env.insert("DOCKER_MACHINE_NAME".to_string(), name.clone());
        }
        env
    }
}

/// Validated request to launch an application session for a user
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawLaunchRequest")]
pub struct LaunchRequest {
    pub command: ApplicationCommand,
    pub user: String,
    pub domain: String,
    pub card: String,
    pub signature: String,
    pub email_domain: String,

    pub pretty_name: Option<String>,
    pub lang: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub token: Option<String>,
    pub minicard: Option<String>,
    pub minisignature: Option<String>,
    pub broker: BrokerOverrides,
    pub database: DatabaseParams,
    pub imap_host: Option<String>,
    pub smtp_host: Option<String>,
    pub use_bind_mount_for_libraries: Option<FlagValue>,
    pub enable_libreoffice_autosave: Option<FlagValue>,
    pub webdav_host: Option<String>,
    pub runtime_host: Option<RuntimeHostOverride>,
    pub session_secret: Option<String>,
    pub ws_host: Option<String>,
    pub ws_port: Option<serde_json::Value>,
}

impl LaunchRequest {
    /// Parse and validate a request from the dispatch service's JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Whether the application's libraries are bind-mounted, which replaces
    /// the files-directory mount
    pub fn uses_library_bind_mount(&self) -> bool {
        self.use_bind_mount_for_libraries
            .as_ref()
            .map(FlagValue::is_set)
            .unwrap_or(false)
    }

    /// Environment overrides for runtime invocations
    pub fn runtime_env(&self) -> BTreeMap<String, String> {
        self.runtime_host
            .as_ref()
            .map(RuntimeHostOverride::env)
            .unwrap_or_default()
    }
}

/// Application name as sent on the wire: a single string or a command array
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawCommand {
    Single(String),
    Parts(Vec<String>),
}

/// Request exactly as the dispatch service sends it
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLaunchRequest {
    name: Option<RawCommand>,
    user: Option<String>,
    domain: Option<String>,
    card: Option<String>,
    signature: Option<String>,
    #[serde(rename = "email_domain")]
    email_domain: Option<String>,

    #[serde(rename = "pretty_name")]
    pretty_name: Option<String>,
    lang: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    width: Option<u32>,
    #[serde(default, deserialize_with = "lenient_number")]
    height: Option<u32>,
    token: Option<String>,
    minicard: Option<String>,
    minisignature: Option<String>,

    amqp_bus_host: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    amqp_bus_port: Option<u16>,
    amqp_bus_user: Option<String>,
    amqp_bus_pass: Option<String>,

    mysql_host: Option<String>,
    mysql_username: Option<String>,
    mysql_password: Option<String>,
    mysql_db_name: Option<String>,

    #[serde(rename = "imap_host")]
    imap_host: Option<String>,
    #[serde(rename = "smtp_host")]
    smtp_host: Option<String>,
    #[serde(rename = "use_bind_mount_for_libraries")]
    use_bind_mount_for_libraries: Option<FlagValue>,
    #[serde(rename = "enable_libreoffice_autosave")]
    enable_libreoffice_autosave: Option<FlagValue>,
    #[serde(rename = "webDAVHost")]
    webdav_host: Option<String>,

    #[serde(default)]
    localisation: bool,
    docker_host: Option<String>,
    #[serde(rename = "dockerTLSVerify")]
    docker_tls_verify: Option<FlagValue>,
    docker_machine_name: Option<String>,

    spice_password: Option<String>,
    ws_host: Option<String>,
    ws_port: Option<serde_json::Value>,
}

/// Number sent either as a JSON number or as a numeric string; an empty
/// string counts as absent
fn lenient_number<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText {
        Number(u64),
        Text(String),
    }

    let text = match Option::<NumberOrText>::deserialize(deserializer)? {
        None => return Ok(None),
        Some(NumberOrText::Number(n)) => n.to_string(),
        Some(NumberOrText::Text(s)) => s.trim().to_string(),
    };
    if text.is_empty() {
        return Ok(None);
    }
    text.parse::<T>()
        .map(Some)
        .map_err(|e| <D::Error as de::Error>::custom(format!("invalid number '{}': {}", text, e)))
}

fn required(value: Option<String>, field: &'static str, missing: &mut Vec<&'static str>) -> String {
    match value {
        Some(v) if !v.trim().is_empty() => v,
        _ => {
            missing.push(field);
            String::new()
        }
    }
}

impl TryFrom<RawLaunchRequest> for LaunchRequest {
    type Error = RequestError;

    fn try_from(raw: RawLaunchRequest) -> Result<Self, Self::Error> {
        let mut missing = Vec::new();

        let command = match raw.name {
            Some(RawCommand::Single(name)) => ApplicationCommand::new(vec![name]),
            Some(RawCommand::Parts(parts)) => ApplicationCommand::new(parts),
            None => None,
        };
        if command.is_none() {
            missing.push("name");
        }

        let user = required(raw.user, "user", &mut missing);
        let domain = required(raw.domain, "domain", &mut missing);
        let card = required(raw.card, "card", &mut missing);
        let signature = required(raw.signature, "signature", &mut missing);
        let email_domain = required(raw.email_domain, "email_domain", &mut missing);

        let command = match command {
            Some(command) if missing.is_empty() => command,
            _ => return Err(RequestError::MissingFields(missing)),
        };

        let runtime_host = if raw.localisation || raw.docker_host.is_some() {
            Some(RuntimeHostOverride {
                host: raw.docker_host,
                tls_verify: raw.docker_tls_verify.map(|flag| flag.as_env()),
                machine_name: raw.docker_machine_name,
            })
        } else {
            None
        };

        Ok(Self {
            command,
            user,
            domain,
            card,
            signature,
            email_domain,
            pretty_name: raw.pretty_name,
            lang: raw.lang,
            width: raw.width,
            height: raw.height,
            token: raw.token,
            minicard: raw.minicard,
            minisignature: raw.minisignature,
            broker: BrokerOverrides {
                host: raw.amqp_bus_host,
                port: raw.amqp_bus_port,
                login: raw.amqp_bus_user,
                password: raw.amqp_bus_pass,
            },
            database: DatabaseParams {
                host: raw.mysql_host,
                username: raw.mysql_username,
                password: raw.mysql_password,
                name: raw.mysql_db_name,
            },
            imap_host: raw.imap_host,
            smtp_host: raw.smtp_host,
            use_bind_mount_for_libraries: raw.use_bind_mount_for_libraries,
            enable_libreoffice_autosave: raw.enable_libreoffice_autosave,
            webdav_host: raw.webdav_host,
            runtime_host,
            session_secret: raw.spice_password,
            ws_host: raw.ws_host,
            ws_port: raw.ws_port,
        })
    }
}

// ============================================================================
// Session Secret
// ============================================================================

/// Per-session token shared by the display protocol and the launched session
#[derive(Clone, PartialEq, Eq)]
pub struct SessionSecret(String);

impl SessionSecret {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionSecret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionSecret(<redacted>)")
    }
}

// ============================================================================
// Broker Subscription
// ============================================================================

/// Topic exchange provisioned for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    exchange: String,
    address: String,
}

impl Subscription {
    pub fn new(exchange: impl Into<String>) -> Self {
        let exchange = exchange.into();
        let address = format!("/exchange/{}/{}", exchange, exchange);
        Self { exchange, address }
    }

    /// Subscription from either a routing address (`/exchange/<e>/<e>`) or a
    /// bare exchange name
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        match value.strip_prefix("/exchange/") {
            Some(rest) => Self::new(rest.split('/').next().unwrap_or(rest)),
            None => Self::new(value),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Routing path clients subscribe to
    pub fn address(&self) -> &str {
        &self.address
    }
}

// ============================================================================
// Connectivity Descriptor
// ============================================================================

/// Endpoint and credentials returned to the dispatch service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityDescriptor {
    /// Display protocol host
    pub host: String,

    /// Display protocol port
    pub port: String,

    pub protocol: String,

    /// Session secret
    pub token: String,

    pub bus_host: String,

    pub bus_port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus_user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus_pass: Option<String>,

    pub bus_subscriptions: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_port: Option<serde_json::Value>,
}

pub const DISPLAY_PROTOCOL: &str = "wss";

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MINIMAL: &str = r#"{
        "name": ["writer", "report.odt"],
        "user": "alice",
        "domain": "example.com",
        "card": "{\"user\":\"alice\"}",
        "signature": "sig",
        "email_domain": "mail.example.com"
    }"#;

    #[test]
    fn test_minimal_request() {
        let request = LaunchRequest::from_json(MINIMAL).unwrap();
        assert_eq!(request.command.application(), "writer");
        assert_eq!(request.command.parts(), ["writer", "report.odt"]);
        assert_eq!(request.user, "alice");
        assert!(request.runtime_host.is_none());
        assert!(!request.uses_library_bind_mount());
        assert!(request.runtime_env().is_empty());
    }

    #[test]
    fn test_single_string_application() {
        let json = MINIMAL.replace(r#"["writer", "report.odt"]"#, r#""mail""#);
        let request = LaunchRequest::from_json(&json).unwrap();
        assert_eq!(request.command.parts(), ["mail"]);
    }

    #[test]
    fn test_missing_fields_are_rejected() {
        let err = LaunchRequest::from_json(r#"{"user": "alice", "card": ""}"#).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("name"));
        assert!(message.contains("domain"));
        assert!(message.contains("card"));
        assert!(message.contains("signature"));
        assert!(message.contains("email_domain"));
        assert!(!message.contains("user,"));
    }

    #[test]
    fn test_missing_fields_list() {
        let raw = RawLaunchRequest {
            name: Some(RawCommand::Parts(vec![])),
            user: Some("alice".to_string()),
            ..Default::default()
        };
        let err = LaunchRequest::try_from(raw).unwrap_err();
        assert_eq!(
            err,
            RequestError::MissingFields(vec!["name", "domain", "card", "signature", "email_domain"])
        );
    }

    #[test]
    fn test_numeric_fields_accept_strings() {
        let json = MINIMAL.replace(
            r#""signature": "sig","#,
            r#""signature": "sig", "width": "1280", "height": 800, "amqpBusPort": "5673","#,
        );
        let request = LaunchRequest::from_json(&json).unwrap();
        assert_eq!(request.width, Some(1280));
        assert_eq!(request.height, Some(800));
        assert_eq!(request.broker.port, Some(5673));
    }

    #[test]
    fn test_numeric_fields_empty_or_invalid() {
        let json = MINIMAL.replace(
            r#""signature": "sig","#,
            r#""signature": "sig", "width": "", "amqpBusPort": null,"#,
        );
        let request = LaunchRequest::from_json(&json).unwrap();
        assert_eq!(request.width, None);
        assert_eq!(request.broker.port, None);

        let json = MINIMAL.replace(r#""signature": "sig","#, r#""signature": "sig", "amqpBusPort": "70000","#);
        assert!(LaunchRequest::from_json(&json).is_err());

        let json = MINIMAL.replace(r#""signature": "sig","#, r#""signature": "sig", "width": "wide","#);
        assert!(LaunchRequest::from_json(&json).is_err());
    }

    #[test]
    fn test_flag_values() {
        assert!(FlagValue::Bool(true).is_set());
        assert!(!FlagValue::Bool(false).is_set());
        assert!(FlagValue::Text("true".to_string()).is_set());
        assert!(!FlagValue::Text("false".to_string()).is_set());
        assert!(!FlagValue::Text(String::new()).is_set());
        assert_eq!(FlagValue::Text("false".to_string()).as_env(), "false");
        assert_eq!(FlagValue::Bool(true).as_env(), "true");
    }

    #[test]
    fn test_runtime_host_override() {
        let json = MINIMAL.replace(
            r#""signature": "sig","#,
            r#""signature": "sig", "localisation": true, "dockerHost": "tcp://1.2.3.4:2376",
               "dockerTLSVerify": "1", "dockerMachineName": "node-2","#,
        );
        let request = LaunchRequest::from_json(&json).unwrap();
        let host = request.runtime_host.as_ref().unwrap();
        assert_eq!(host.remote_host(), Some("tcp://1.2.3.4:2376"));

        let env = request.runtime_env();
        assert_eq!(env.get("DOCKER_HOST").map(String::as_str), Some("tcp://1.2.3.4:2376"));
        assert_eq!(env.get("DOCKER_TLS_VERIFY").map(String::as_str), Some("1"));
        assert_eq!(env.get("DOCKER_MACHINE_NAME").map(String::as_str), Some("node-2"));
    }

    #[test]
    fn test_unix_socket_is_not_remote() {
        let host = RuntimeHostOverride {
            host: Some("unix:///var/run/docker.sock".to_string()),
            ..Default::default()
        };
        assert_eq!(host.remote_host(), None);
    }

    #[test]
    fn test_subscription_address() {
        let subscription = Subscription::new("user_alice@example.com_app_1");
        assert_eq!(
            subscription.address(),
            "/exchange/user_alice@example.com_app_1/user_alice@example.com_app_1"
        );
    }

    #[test]
    fn test_subscription_parse() {
        let expected = Subscription::new("user_alice@example.com_app_1");
        assert_eq!(Subscription::parse("user_alice@example.com_app_1"), expected);
        assert_eq!(
            Subscription::parse("/exchange/user_alice@example.com_app_1/user_alice@example.com_app_1"),
            expected
        );
        assert_eq!(Subscription::parse(expected.address()).address(), expected.address());
    }

    #[test]
    fn test_descriptor_serialization() {
        let descriptor = ConnectivityDescriptor {
            host: "10.0.0.1".to_string(),
            port: "32768".to_string(),
            protocol: DISPLAY_PROTOCOL.to_string(),
            token: "secret".to_string(),
            bus_host: "10.0.0.1".to_string(),
            bus_port: 61613,
            bus_user: Some("mini".to_string()),
            bus_pass: None,
            bus_subscriptions: vec!["/exchange/e/e".to_string()],
            ws_host: None,
            ws_port: Some(serde_json::json!(8443)),
        };
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["busPort"], 61613);
        assert_eq!(json["busUser"], "mini");
        assert_eq!(json["wsPort"], 8443);
        assert!(json.get("busPass").is_none());
        assert!(json.get("wsHost").is_none());
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = SessionSecret::from("hunter2".to_string());
        assert!(!format!("{:?}", secret).contains("hunter2"));
    }
}
