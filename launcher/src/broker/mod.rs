//! Message broker subscription provisioning
//!
//! Every launched session gets its own auto-deleting topic exchange. The
//! connection used to declare it is opened per launch and always closed
//! before provisioning returns.

mod amqp;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::models::{LaunchRequest, Subscription};

pub use amqp::AmqpBrokerClient;

/// Broker connection parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerParams {
    pub host: String,
    pub port: u16,
    pub login: String,
    pub password: String,
}

/// Exchange routing semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub kind: ExchangeKind,
    /// Removed by the broker once its last binding goes away
    pub auto_delete: bool,
}

/// Opens broker connections
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn connect(&self, params: &BrokerParams) -> Result<Box<dyn BrokerConnection>, BrokerError>;
}

/// An open broker connection, private to one launch
#[async_trait]
pub trait BrokerConnection: Send {
    async fn declare_exchange(&mut self, name: &str, options: &ExchangeOptions) -> Result<(), BrokerError>;

    async fn disconnect(self: Box<Self>) -> Result<(), BrokerError>;
}

/// Exchange name unique to a user, domain and launch
pub fn exchange_name(user: &str, domain: &str) -> String {
    format!("user_{}@{}_app_{}", user, domain, Uuid::new_v4())
}

/// Creates the per-session topic exchange
pub struct SubscriptionProvisioner {
    client: Arc<dyn BrokerClient>,
    defaults: BrokerParams,
    timeout: Duration,
}

impl SubscriptionProvisioner {
    /// `bus_host` is used when a request does not name a broker host
    pub fn new(client: Arc<dyn BrokerClient>, config: &BrokerConfig, bus_host: &str) -> Self {
        Self {
            client,
            defaults: BrokerParams {
                host: bus_host.to_string(),
                port: config.amqp_port,
                login: config.login.clone(),
                password: config.password.clone(),
            },
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Connection parameters for a request, falling back to the launcher's own
    pub fn connection_params(&self, request: &LaunchRequest) -> BrokerParams {
        let overrides = &request.broker;
        BrokerParams {
            host: overrides
                .host
                .clone()
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| self.defaults.host.clone()),
            port: overrides.port.unwrap_or(self.defaults.port),
            login: overrides.login.clone().unwrap_or_else(|| self.defaults.login.clone()),
            password: overrides
                .password
                .clone()
                .unwrap_or_else(|| self.defaults.password.clone()),
        }
    }

    /// Declare a fresh topic exchange for the request's session
    pub async fn provision(&self, request: &LaunchRequest) -> Result<Subscription, BrokerError> {
        let exchange = exchange_name(&request.user, &request.domain);
        let params = self.connection_params(request);

        let mut connection = match timeout(self.timeout, self.client.connect(&params)).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                error!(host = %params.host, port = params.port, error = %e, "Broker connection failed");
                return Err(e);
            }
            Err(_) => {
                error!(host = %params.host, port = params.port, "Broker connection timed out");
                return Err(BrokerError::Timeout {
                    operation: "broker connect",
                    after: self.timeout,
                });
            }
        };
        debug!(host = %params.host, port = params.port, "Broker connection established");

        let options = ExchangeOptions {
            kind: ExchangeKind::Topic,
            auto_delete: true,
        };
        let declared = match timeout(self.timeout, connection.declare_exchange(&exchange, &options)).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout {
                operation: "exchange declare",
                after: self.timeout,
            }),
        };

        match timeout(self.timeout, connection.disconnect()).await {
            Ok(Ok(())) => debug!("Broker connection closed"),
            Ok(Err(e)) => warn!(error = %e, "Broker disconnect failed"),
            Err(_) => warn!("Broker disconnect timed out"),
        }

        if let Err(e) = declared {
            error!(exchange = %exchange, error = %e, "Exchange declaration failed");
            return Err(e);
        }

        let subscription = Subscription::new(exchange);
        info!(
            exchange = %subscription.exchange(),
            address = %subscription.address(),
            "Session subscription provisioned"
        );
        Ok(subscription)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording broker fake

    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    #[derive(Debug, Default)]
    pub struct Recorded {
        pub connects: Vec<BrokerParams>,
        pub declared: Vec<(String, ExchangeOptions)>,
        pub disconnects: usize,
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub enum Failure {
        #[default]
        None,
        Connect,
        Declare,
        StallDeclare,
    }

    #[derive(Clone, Default)]
    pub struct RecordingBroker {
        pub recorded: Arc<Mutex<Recorded>>,
        pub failure: Failure,
    }

    impl RecordingBroker {
        pub fn failing(failure: Failure) -> Self {
            Self {
                failure,
                ..Default::default()
            }
        }

        pub fn connects(&self) -> Vec<BrokerParams> {
            self.recorded.lock().unwrap().connects.clone()
        }

        pub fn declared(&self) -> Vec<(String, ExchangeOptions)> {
            self.recorded.lock().unwrap().declared.clone()
        }

        pub fn disconnects(&self) -> usize {
            self.recorded.lock().unwrap().disconnects
        }
    }

    struct RecordingConnection {
        recorded: Arc<Mutex<Recorded>>,
        failure: Failure,
    }

    #[async_trait]
    impl BrokerClient for RecordingBroker {
        async fn connect(&self, params: &BrokerParams) -> Result<Box<dyn BrokerConnection>, BrokerError> {
            self.recorded.lock().unwrap().connects.push(params.clone());
            if self.failure == Failure::Connect {
                return Err(BrokerError::Connect {
                    host: params.host.clone(),
                    port: params.port,
                    reason: "connection refused".to_string(),
                });
            }
            Ok(Box::new(RecordingConnection {
                recorded: self.recorded.clone(),
                failure: self.failure,
            }))
        }
    }

    #[async_trait]
    impl BrokerConnection for RecordingConnection {
        async fn declare_exchange(&mut self, name: &str, options: &ExchangeOptions) -> Result<(), BrokerError> {
            match self.failure {
                Failure::Declare => Err(BrokerError::DeclareExchange {
                    exchange: name.to_string(),
                    reason: "access refused".to_string(),
                }),
                Failure::StallDeclare => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                }
                _ => {
                    self.recorded
                        .lock()
                        .unwrap()
                        .declared
                        .push((name.to_string(), *options));
                    Ok(())
                }
            }
        }

        async fn disconnect(self: Box<Self>) -> Result<(), BrokerError> {
            self.recorded.lock().unwrap().disconnects += 1;
            Ok(())
        }
    }
}
