//! AMQP 0-9-1 broker client built on lapin

use std::future::Future;

use async_trait::async_trait;
use lapin::options::ExchangeDeclareOptions;
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use tracing::{debug, warn};

use crate::error::BrokerError;

use super::{BrokerClient, BrokerConnection, BrokerParams, ExchangeKind, ExchangeOptions};

/// AMQP reply code for a normal close
const REPLY_SUCCESS: u16 = 200;

/// Connects to an AMQP broker on the default virtual host
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpBrokerClient;

impl AmqpBrokerClient {
    fn uri(params: &BrokerParams) -> Result<String, BrokerError> {
        let connect_error = |reason: String| BrokerError::Connect {
            host: params.host.clone(),
            port: params.port,
            reason,
        };

        let mut uri = url::Url::parse("amqp://localhost/%2f").map_err(|e| connect_error(e.to_string()))?;
        uri.set_host(Some(params.host.as_str()))
            .map_err(|e| connect_error(format!("invalid host: {}", e)))?;
        uri.set_port(Some(params.port))
            .map_err(|_| connect_error("invalid port".to_string()))?;
        uri.set_username(&params.login)
            .map_err(|_| connect_error("invalid login".to_string()))?;
        uri.set_password(Some(params.password.as_str()))
            .map_err(|_| connect_error("invalid password".to_string()))?;

        Ok(uri.to_string())
    }
}

/// Run `close` before handing back a failed `result`
async fn close_on_error<T, E, C, F>(result: Result<T, E>, close: C) -> Result<T, E>
where
    C: FnOnce() -> F,
    F: Future<Output = ()>,
{
    if result.is_err() {
        close().await;
    }
    result
}

struct AmqpConnection {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerClient for AmqpBrokerClient {
    async fn connect(&self, params: &BrokerParams) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let uri = Self::uri(params)?;
        let connect_error = |e: lapin::Error| BrokerError::Connect {
            host: params.host.clone(),
            port: params.port,
            reason: e.to_string(),
        };

        let connection = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(connect_error)?;
        let opened = &connection;
        let channel = close_on_error(connection.create_channel().await, || async move {
            if let Err(e) = opened.close(REPLY_SUCCESS, "channel open failed").await {
                warn!(host = %params.host, error = %e, "Failed to close AMQP connection");
            }
        })
        .await
        .map_err(connect_error)?;

        debug!(host = %params.host, port = params.port, "AMQP channel opened");
        Ok(Box::new(AmqpConnection { connection, channel }))
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn declare_exchange(&mut self, name: &str, options: &ExchangeOptions) -> Result<(), BrokerError> {
        let kind = match options.kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        };
        let declare_options = ExchangeDeclareOptions {
            auto_delete: options.auto_delete,
            ..ExchangeDeclareOptions::default()
        };

        self.channel
            .exchange_declare(name, kind, declare_options, FieldTable::default())
            .await
            .map_err(|e| BrokerError::DeclareExchange {
                exchange: name.to_string(),
                reason: e.to_string(),
            })
    }

    async fn disconnect(self: Box<Self>) -> Result<(), BrokerError> {
        self.connection
            .close(REPLY_SUCCESS, "session subscription provisioned")
            .await
            .map_err(|e| BrokerError::Disconnect(e.to_string()))
    }
}
