//! Session launch orchestration
//!
//! [`SessionLauncher`] ties the pieces together: it waits for the runtime
//! executable to be resolved, provisions the session's broker subscription,
//! builds and runs the container, and reports where the session can be
//! reached.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::broker::{AmqpBrokerClient, BrokerClient, SubscriptionProvisioner};
use crate::config::LauncherConfig;
use crate::container::{
    resolve_runtime_binary, CommandBuilder, ImageSelector, ProcessRunner, RuntimeExecutor,
    RuntimeInvocation, TokioProcessRunner,
};
use crate::error::LaunchError;
use crate::metrics;
use crate::models::{
    ConnectivityDescriptor, LaunchRequest, SessionSecret, Subscription, DISPLAY_PROTOCOL,
};

/// Runtime executable resolution progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LauncherState {
    Resolving,
    Ready(String),
}

/// Launches application sessions
pub struct SessionLauncher {
    /// Launcher configuration
    config: LauncherConfig,

    /// Bus address advertised to sessions and clients
    bus_host: String,

    /// Secret used when a request carries none
    secret: SessionSecret,

    /// Extra runtime arguments, parsed once
    extra_args: Vec<String>,

    images: ImageSelector,

    provisioner: SubscriptionProvisioner,

    executor: RuntimeExecutor,

    /// Resolved runtime executable, `None` until resolution finishes
    binary: watch::Receiver<Option<String>>,
}

impl SessionLauncher {
    /// Create a launcher talking to AMQP and the local process table.
    ///
    /// Must be called within a tokio runtime; runtime executable resolution
    /// starts immediately in the background.
    pub fn new(
        config: LauncherConfig,
        bus_host: impl Into<String>,
        secret: Option<String>,
    ) -> Self {
        Self::with_backends(
            config,
            bus_host,
            secret,
            Arc::new(AmqpBrokerClient),
            Arc::new(TokioProcessRunner),
        )
    }

    /// Create a launcher with explicit broker and process backends
    pub fn with_backends(
        config: LauncherConfig,
        bus_host: impl Into<String>,
        secret: Option<String>,
        broker: Arc<dyn BrokerClient>,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        let bus_host = bus_host.into();
        let secret = secret
            .filter(|s| !s.is_empty())
            .map(SessionSecret::from)
            .unwrap_or_else(SessionSecret::generate);

        let (tx, binary) = watch::channel(None);
        let runtime = config.runtime.clone();
        tokio::spawn(async move {
            let resolved = resolve_runtime_binary(
                &runtime.install_dir,
                &runtime.binary,
                runtime.version.as_deref(),
            )
            .await;
            // Receivers may all be gone if the launcher was dropped meanwhile
            let _ = tx.send(Some(resolved));
        });

        let extra_args = config.extra_runtime_args();
        let images = ImageSelector::new(config.images.clone());
        let provisioner = SubscriptionProvisioner::new(broker, &config.broker, &bus_host);
        let executor = RuntimeExecutor::new(
            runner,
            Duration::from_secs(config.runtime.run_timeout_secs),
            Duration::from_secs(config.runtime.query_timeout_secs),
        );

        info!(bus_host = %bus_host, "Session launcher initialized");

        Self {
            config,
            bus_host,
            secret,
            extra_args,
            images,
            provisioner,
            executor,
            binary,
        }
    }

    /// Current runtime executable resolution state
    pub fn state(&self) -> LauncherState {
        match self.binary.borrow().as_ref() {
            Some(binary) => LauncherState::Ready(binary.clone()),
            None => LauncherState::Resolving,
        }
    }

    /// Wait for the runtime executable to be resolved
    pub async fn runtime_binary(&self) -> Result<String, LaunchError> {
        let mut binary = self.binary.clone();
        let resolved = binary
            .wait_for(Option::is_some)
            .await
            .map_err(|_| LaunchError::Config("runtime binary resolution was aborted".to_string()))?;
        Ok((*resolved).clone().unwrap_or_default())
    }

    pub fn bus_host(&self) -> &str {
        &self.bus_host
    }

    pub fn images(&self) -> &ImageSelector {
        &self.images
    }

    /// Build the container invocation for a request without running it
    pub async fn plan(
        &self,
        request: &LaunchRequest,
        subscription: &Subscription,
    ) -> Result<RuntimeInvocation, LaunchError> {
        let binary = self.runtime_binary().await?;
        Ok(self.build(&binary, request, subscription))
    }

    /// Launch a session and describe how to reach it
    #[instrument(
        skip(self, request),
        fields(
            user = %request.user,
            domain = %request.domain,
            application = %request.command.application()
        )
    )]
    pub async fn launch(
        &self,
        request: &LaunchRequest,
    ) -> Result<ConnectivityDescriptor, LaunchError> {
        let application = request.command.application().to_string();
        let started = Instant::now();
        metrics::record_launch_started(&application);

        match self.run_launch(request).await {
            Ok(descriptor) => {
                let elapsed = started.elapsed();
                metrics::record_launch_succeeded(&application, elapsed.as_secs_f64());
                info!(
                    host = %descriptor.host,
                    port = %descriptor.port,
                    duration_ms = elapsed.as_millis() as u64,
                    "Session launched"
                );
                Ok(descriptor)
            }
            Err(e) => {
                metrics::record_launch_failed(&application, e.stage());
                error!(stage = e.stage(), error = %e, "Session launch failed");
                Err(e)
            }
        }
    }

    async fn run_launch(
        &self,
        request: &LaunchRequest,
    ) -> Result<ConnectivityDescriptor, LaunchError> {
        let binary = self.runtime_binary().await?;
        let subscription = self.provisioner.provision(request).await?;

        let invocation = self.build(&binary, request, &subscription);
        let endpoint = self
            .executor
            .run(
                &invocation,
                &request.runtime_env(),
                request.runtime_host.as_ref(),
                &self.bus_host,
            )
            .await?;

        Ok(ConnectivityDescriptor {
            host: endpoint.host,
            port: endpoint.port.to_string(),
            protocol: DISPLAY_PROTOCOL.to_string(),
            token: self.effective_secret(request).as_str().to_string(),
            bus_host: self.bus_host.clone(),
            bus_port: self.config.broker.stomp_port,
            bus_user: request.minicard.clone(),
            bus_pass: request.minisignature.clone(),
            bus_subscriptions: vec![subscription.address().to_string()],
            ws_host: request.ws_host.clone().filter(|host| !host.is_empty()),
            ws_port: request.ws_port.clone().filter(is_present),
        })
    }

    fn build(
        &self,
        binary: &str,
        request: &LaunchRequest,
        subscription: &Subscription,
    ) -> RuntimeInvocation {
        let secret = self.effective_secret(request);
        CommandBuilder {
            config: &self.config,
            binary,
            bus_host: &self.bus_host,
            secret: &secret,
            extra_args: &self.extra_args,
            images: &self.images,
        }
        .build(request, subscription)
    }

    /// The request's own secret wins over the launcher's
    fn effective_secret(&self, request: &LaunchRequest) -> SessionSecret {
        match request.session_secret.as_deref() {
            Some(secret) if !secret.is_empty() => SessionSecret::from(secret.to_string()),
            _ => self.secret.clone(),
        }
    }
}

/// Whether a caller-supplied override carries a value: not null, false, 0 or ""
fn is_present(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64() != Some(0.0),
        serde_json::Value::String(s) => !s.is_empty(),
        _ => true,
    }
}
