//! Container runtime process execution and published-port resolution

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::error::{LaunchError, RequestError, RuntimeError};
use crate::models::RuntimeHostOverride;

use super::command::RuntimeInvocation;
use super::port::{parse_port_mapping, PortMapping};

/// Captured result of a finished child process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, `None` when terminated by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs an executable with explicit environment overrides.
///
/// Overrides are layered on top of the inherited environment of the child
/// only; the launcher's own environment is never modified.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> std::io::Result<ProcessOutput>;
}

/// [`ProcessRunner`] backed by `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> std::io::Result<ProcessOutput> {
        let output = Command::new(program)
            .args(args)
            .envs(env)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(ProcessOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Where a launched session can be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEndpoint {
    pub container_id: String,
    pub host: String,
    pub port: u16,
}

/// Executes container runs and resolves their published display port
pub struct RuntimeExecutor {
    runner: Arc<dyn ProcessRunner>,
    run_timeout: Duration,
    query_timeout: Duration,
}

impl RuntimeExecutor {
    pub fn new(runner: Arc<dyn ProcessRunner>, run_timeout: Duration, query_timeout: Duration) -> Self {
        Self {
            runner,
            run_timeout,
            query_timeout,
        }
    }

    /// Start the container, then resolve the externally-reachable endpoint of
    /// its published port.
    ///
    /// `env` is applied to both runtime invocations. A wildcard bind host
    /// resolves to the remote runtime host from `topology`, or to `bus_host`
    /// for a local runtime.
    pub async fn run(
        &self,
        invocation: &RuntimeInvocation,
        env: &BTreeMap<String, String>,
        topology: Option<&RuntimeHostOverride>,
        bus_host: &str,
    ) -> Result<SessionEndpoint, LaunchError> {
        let container_id = self.start_container(invocation, env).await?;

        let mapping = self
            .query_port(invocation.program(), &container_id, env)
            .await?;
        let host = resolve_display_host(&mapping, topology, bus_host)?;

        info!(
            container_id = %container_id,
            host = %host,
            port = mapping.port,
            "Session endpoint resolved"
        );

        Ok(SessionEndpoint {
            container_id,
            host,
            port: mapping.port,
        })
    }

    async fn start_container(
        &self,
        invocation: &RuntimeInvocation,
        env: &BTreeMap<String, String>,
    ) -> Result<String, RuntimeError> {
        info!(
            program = %invocation.program(),
            container_name = %invocation.container_name(),
            image = %invocation.image(),
            remote = !env.is_empty(),
            "Starting session container"
        );
        debug!(command = ?invocation.redacted_command_line(), "Container run command");

        let output = self
            .exec("run", invocation.program(), invocation.args(), env, self.run_timeout)
            .await?;

        let container_id = output.stdout.lines().next().unwrap_or("").trim().to_string();
        if container_id.is_empty() {
            error!(stderr = %output.stderr.trim(), "Container run printed no container id");
            return Err(RuntimeError::MissingContainerId);
        }

        info!(container_id = %container_id, "Container started");
        Ok(container_id)
    }

    async fn query_port(
        &self,
        program: &str,
        container_id: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<PortMapping, LaunchError> {
        let args = vec!["port".to_string(), container_id.to_string()];
        let output = self.exec("port", program, &args, env, self.query_timeout).await?;

        parse_port_mapping(&output.stdout).map_err(|e| {
            error!(
                container_id = %container_id,
                stdout = %output.stdout.trim(),
                error = %e,
                "Cannot parse published port"
            );
            LaunchError::Parse(e)
        })
    }

    async fn exec(
        &self,
        command: &'static str,
        program: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        limit: Duration,
    ) -> Result<ProcessOutput, RuntimeError> {
        let output = match timeout(limit, self.runner.run(program, args, env)).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!(program = %program, command = command, error = %e, "Failed to execute runtime");
                return Err(RuntimeError::Spawn {
                    program: program.to_string(),
                    source: e,
                });
            }
            Err(_) => {
                error!(program = %program, command = command, timeout = ?limit, "Runtime command timed out");
                return Err(RuntimeError::Timeout { command, after: limit });
            }
        };

        if !output.success() {
            error!(
                program = %program,
                command = command,
                status = ?output.status,
                stdout = %output.stdout.trim(),
                stderr = %output.stderr.trim(),
                "Runtime command failed"
            );
            return Err(RuntimeError::Exit {
                command,
                code: output.status,
                stderr: output.stderr.trim().to_string(),
            });
        }

        Ok(output)
    }
}

/// Externally-reachable host for a published port
pub fn resolve_display_host(
    mapping: &PortMapping,
    topology: Option<&RuntimeHostOverride>,
    bus_host: &str,
) -> Result<String, RequestError> {
    if !mapping.is_wildcard() {
        return Ok(mapping.host.clone());
    }

    match topology.and_then(RuntimeHostOverride::remote_host) {
        Some(remote) => hostname_of(remote).ok_or_else(|| RequestError::InvalidRuntimeHost(remote.to_string())),
        None => Ok(bus_host.to_string()),
    }
}

/// Hostname of a runtime endpoint such as `tcp://10.0.0.5:2376`
fn hostname_of(endpoint: &str) -> Option<String> {
    let parsed = if endpoint.contains("://") {
        url::Url::parse(endpoint).ok()?
    } else {
        url::Url::parse(&format!("tcp://{}", endpoint)).ok()?
    };

    parsed
        .host_str()
        .filter(|host| !host.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LauncherConfig;
    use crate::container::image::ImageSelector;
    use crate::container::CommandBuilder;
    use crate::models::{LaunchRequest, SessionSecret, Subscription};
    use pretty_assertions::assert_eq;

    fn invocation() -> RuntimeInvocation {
        let config = LauncherConfig::default();
        let request = LaunchRequest::from_json(
            r#"{"name": ["calc"], "user": "bob", "domain": "example.com", "card": "c",
                "signature": "s", "email_domain": "example.com"}"#,
        )
        .unwrap();
        let secret = SessionSecret::generate();
        let images = ImageSelector::new(config.images.clone());
        CommandBuilder {
            config: &config,
            binary: "docker",
            bus_host: "10.0.0.1",
            secret: &secret,
            extra_args: &[],
            images: &images,
        }
        .build(&request, &Subscription::new("user_bob@example.com_app_1"))
    }

    fn ok(stdout: &str) -> std::io::Result<ProcessOutput> {
        Ok(ProcessOutput {
            status: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    fn executor(runner: impl ProcessRunner + 'static) -> RuntimeExecutor {
        RuntimeExecutor::new(Arc::new(runner), Duration::from_secs(5), Duration::from_secs(5))
    }

    fn remote(host: &str) -> RuntimeHostOverride {
        RuntimeHostOverride {
            host: Some(host.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_local_run_resolves_bus_host() {
        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .withf(|program, args, env| {
                program.to_string() == "docker" && args[0] == "run" && env.is_empty()
            })
            .times(1)
            .returning(|_, _, _| ok("4f2a9c\n"));
        runner
            .expect_run()
            .withf(|program, args, _| {
                program.to_string() == "docker" && args.len() == 2 && args[0] == "port" && args[1] == "4f2a9c"
            })
            .times(1)
            .returning(|_, _, _| ok("5900/tcp -> 0.0.0.0:32768\n"));

        let endpoint = executor(runner)
            .run(&invocation(), &BTreeMap::new(), None, "10.0.0.1")
            .await
            .unwrap();

        assert_eq!(
            endpoint,
            SessionEndpoint {
                container_id: "4f2a9c".to_string(),
                host: "10.0.0.1".to_string(),
                port: 32768,
            }
        );
    }

    #[tokio::test]
    async fn test_remote_run_passes_env_to_both_commands() {
        let topology = RuntimeHostOverride {
            host: Some("tcp://1.2.3.4:2376".to_string()),
            tls_verify: Some("1".to_string()),
            machine_name: Some("node-2".to_string()),
        };
        let env = topology.env();

        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .withf(|_, args, env| {
                args[0] == "run" && env.get("DOCKER_HOST").map(String::as_str) == Some("tcp://1.2.3.4:2376")
            })
            .times(1)
            .returning(|_, _, _| ok("4f2a9c\n"));
        runner
            .expect_run()
            .withf(|_, args, env| {
                args[0] == "port"
                    && env.get("DOCKER_TLS_VERIFY").map(String::as_str) == Some("1")
                    && env.get("DOCKER_MACHINE_NAME").map(String::as_str) == Some("node-2")
            })
            .times(1)
            .returning(|_, _, _| ok("5900/tcp -> 0.0.0.0:32768\n"));

        let endpoint = executor(runner)
            .run(&invocation(), &env, Some(&topology), "10.0.0.1")
            .await
            .unwrap();

        assert_eq!(endpoint.host, "1.2.3.4");
        assert_eq!(endpoint.port, 32768);
    }

    #[tokio::test]
    async fn test_run_failure_is_returned() {
        let mut runner = MockProcessRunner::new();
        runner.expect_run().times(1).returning(|_, _, _| {
            Ok(ProcessOutput {
                status: Some(125),
                stdout: String::new(),
                stderr: "Unable to find image\n".to_string(),
            })
        });

        let err = executor(runner)
            .run(&invocation(), &BTreeMap::new(), None, "10.0.0.1")
            .await
            .unwrap_err();

        match err {
            LaunchError::Runtime(RuntimeError::Exit { command, code, stderr }) => {
                assert_eq!(command, "run");
                assert_eq!(code, Some(125));
                assert_eq!(stderr, "Unable to find image");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_port_query_failure_is_returned() {
        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .withf(|_, args, _| args[0] == "run")
            .times(1)
            .returning(|_, _, _| ok("4f2a9c\n"));
        runner
            .expect_run()
            .withf(|_, args, _| args[0] == "port")
            .times(1)
            .returning(|_, _, _| {
                Ok(ProcessOutput {
                    status: Some(1),
                    stdout: String::new(),
                    stderr: "Error: No such container: 4f2a9c\n".to_string(),
                })
            });

        let err = executor(runner)
            .run(&invocation(), &BTreeMap::new(), None, "10.0.0.1")
            .await
            .unwrap_err();

        match err {
            LaunchError::Runtime(RuntimeError::Exit { command, code, stderr }) => {
                assert_eq!(command, "port");
                assert_eq!(code, Some(1));
                assert_eq!(stderr, "Error: No such container: 4f2a9c");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spawn_error_is_returned() {
        let mut runner = MockProcessRunner::new();
        runner.expect_run().times(1).returning(|_, _, _| {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"))
        });

        let err = executor(runner)
            .run(&invocation(), &BTreeMap::new(), None, "10.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Runtime(RuntimeError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_empty_container_id() {
        let mut runner = MockProcessRunner::new();
        runner.expect_run().times(1).returning(|_, _, _| ok("\n"));

        let err = executor(runner)
            .run(&invocation(), &BTreeMap::new(), None, "10.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Runtime(RuntimeError::MissingContainerId)));
    }

    #[tokio::test]
    async fn test_unparseable_port_output() {
        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .withf(|_, args, _| args[0] == "run")
            .returning(|_, _, _| ok("4f2a9c\n"));
        runner
            .expect_run()
            .withf(|_, args, _| args[0] == "port")
            .returning(|_, _, _| ok("Error: No public port '5900/tcp' published\n"));

        let err = executor(runner)
            .run(&invocation(), &BTreeMap::new(), None, "10.0.0.1")
            .await
            .unwrap_err();
        assert_eq!(err.stage(), "parse");
    }

    struct StalledRunner;

    #[async_trait]
    impl ProcessRunner for StalledRunner {
        async fn run(
            &self,
            _program: &str,
            _args: &[String],
            _env: &BTreeMap<String, String>,
        ) -> std::io::Result<ProcessOutput> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            ok("never\n")
        }
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let executor = RuntimeExecutor::new(
            Arc::new(StalledRunner),
            Duration::from_millis(20),
            Duration::from_millis(20),
        );

        let err = executor
            .run(&invocation(), &BTreeMap::new(), None, "10.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LaunchError::Runtime(RuntimeError::Timeout { command: "run", .. })
        ));
    }

    #[test]
    fn test_resolve_display_host() {
        let wildcard = parse_port_mapping("5900/tcp -> 0.0.0.0:32768").unwrap();
        let bound = parse_port_mapping("5900/tcp -> 172.17.0.1:32768").unwrap();

        assert_eq!(resolve_display_host(&wildcard, None, "10.0.0.1").unwrap(), "10.0.0.1");
        assert_eq!(resolve_display_host(&bound, None, "10.0.0.1").unwrap(), "172.17.0.1");
        assert_eq!(
            resolve_display_host(&wildcard, Some(&remote("tcp://1.2.3.4:2376")), "10.0.0.1").unwrap(),
            "1.2.3.4"
        );
        assert_eq!(
            resolve_display_host(&wildcard, Some(&remote("unix:///var/run/docker.sock")), "10.0.0.1")
                .unwrap(),
            "10.0.0.1"
        );
        assert_eq!(
            resolve_display_host(&wildcard, Some(&remote("runtime.internal:2376")), "10.0.0.1").unwrap(),
            "runtime.internal"
        );
    }

    #[test]
    fn test_unusable_runtime_host() {
        let wildcard = parse_port_mapping("5900/tcp -> 0.0.0.0:32768").unwrap();
        let err = resolve_display_host(&wildcard, Some(&remote("tcp://")), "10.0.0.1").unwrap_err();
        assert_eq!(err, RequestError::InvalidRuntimeHost("tcp://".to_string()));
    }

    #[tokio::test]
    async fn test_tokio_runner_captures_output() {
        let runner = TokioProcessRunner;
        let mut env = BTreeMap::new();
        env.insert("APPVM_TEST_VALUE".to_string(), "hello".to_string());

        let output = runner
            .run("sh", &["-c".to_string(), "echo $APPVM_TEST_VALUE; exit 3".to_string()], &env)
            .await
            .unwrap();

        assert_eq!(output.stdout, "hello\n");
        assert_eq!(output.status, Some(3));
        assert!(!output.success());
        assert!(std::env::var("APPVM_TEST_VALUE").is_err());
    }
}
