//! Container run command assembly

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::config::LauncherConfig;
use crate::models::{LaunchRequest, SessionSecret, Subscription};

use super::image::ImageSelector;

/// Environment entries whose values never appear in logs
const SENSITIVE_ENV: &[&str] = &[
    "MYSQL_PASSWORD",
    "SPICE_PASSWD",
    "EYEOS_TOKEN",
    "EYEOS_CARD",
    "EYEOS_SIGNATURE",
    "EYEOS_MINI_CARD",
    "EYEOS_MINI_SIGNATURE",
    "EYEOS_BUS_MASTER_USER",
    "EYEOS_BUS_MASTER_PASSWD",
];

const REDACTED: &str = "<redacted>";

/// Fully-parameterised container run command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeInvocation {
    program: String,
    args: Vec<String>,
    container_name: String,
    image: String,
}

impl RuntimeInvocation {
    /// Runtime executable
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments following the executable, starting with `run`
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Executable followed by all arguments
    pub fn command_line(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// [`command_line`](Self::command_line) with credential values masked, for logging
    pub fn redacted_command_line(&self) -> Vec<String> {
        self.command_line()
            .into_iter()
            .map(|arg| match arg.split_once('=') {
                Some((name, _)) if SENSITIVE_ENV.contains(&name) => format!("{}={}", name, REDACTED),
                _ => arg,
            })
            .collect()
    }
}

/// Builds the container run command for a launch request
pub struct CommandBuilder<'a> {
    pub config: &'a LauncherConfig,
    /// Resolved runtime executable
    pub binary: &'a str,
    /// Externally-known bus address of the launcher
    pub bus_host: &'a str,
    pub secret: &'a SessionSecret,
    pub extra_args: &'a [String],
    pub images: &'a ImageSelector,
}

impl CommandBuilder<'_> {
    /// Assemble the run command.
    ///
    /// Segment order is fixed: flags, environment, mounts, extra arguments,
    /// image, entry command.
    pub fn build(&self, request: &LaunchRequest, subscription: &Subscription) -> RuntimeInvocation {
        let application = request.command.application();
        let container_name = format!("{}_{}_{}", request.user, application, Uuid::new_v4());
        let image = self.images.select(application).reference;

        let mut args = vec![
            "run".to_string(),
            "--name".to_string(),
            container_name.clone(),
            // fuse mount of the user's WebDAV share inside the container
            "--cap-add=SYS_ADMIN".to_string(),
            "--device=/dev/fuse".to_string(),
            format!("--memory={}", self.config.runtime.max_memory),
            format!("--memory-swap={}", self.config.runtime.max_memory),
            format!("--label={}", self.config.runtime.container_label),
            "-d".to_string(),
            "-P".to_string(),
        ];

        for (name, value) in self.environment(request, subscription) {
            args.push("-e".to_string());
            args.push(format!("{}={}", name, value));
        }

        for mount in self.mounts(request) {
            args.push("-v".to_string());
            args.push(mount);
        }

        args.extend(self.extra_args.iter().cloned());
        args.push(image.clone());
        args.push(self.config.runtime.entry_command.clone());

        debug!(
            container_name = %container_name,
            image = %image,
            arg_count = args.len(),
            "Container run command assembled"
        );

        RuntimeInvocation {
            program: self.binary.to_string(),
            args,
            container_name,
            image,
        }
    }

    /// Bind mounts: print spool, home/config, and the files directory unless
    /// libraries are bind-mounted instead
    fn mounts(&self, request: &LaunchRequest) -> Vec<String> {
        let user_root = self
            .config
            .session
            .users_files_path
            .join(&request.domain)
            .join(&request.user);
        let root = user_root.display();

        let mut mounts = vec![
            format!("{}/print:/mnt/eyeos/print", root),
            format!("{}/config:/home/user/", root),
        ];
        if !request.uses_library_bind_mount() {
            mounts.push(format!("{}/files:/home/user/files/", root));
        }
        mounts
    }

    fn environment(&self, request: &LaunchRequest, subscription: &Subscription) -> Vec<(&'static str, String)> {
        let session = &self.config.session;
        let text = |value: &Option<String>| value.clone().unwrap_or_default();
        let flag = |value: &Option<crate::models::FlagValue>| {
            value.as_ref().map(|f| f.as_env()).unwrap_or_else(|| "false".to_string())
        };

        let app_command = Value::Array(
            self.config
                .runtime
                .app_launcher
                .iter()
                .chain(request.command.parts())
                .cloned()
                .map(Value::String)
                .collect(),
        );

        let resolution = format!(
            "{}x{}",
            request.width.unwrap_or(session.default_width),
            request.height.unwrap_or(session.default_height)
        );

        vec![
            ("LANG", request.lang.clone().unwrap_or_else(|| session.default_lang.clone())),
            ("MYSQL_HOST", text(&request.database.host)),
            ("MYSQL_USERNAME", text(&request.database.username)),
            ("MYSQL_PASSWORD", text(&request.database.password)),
            ("MYSQL_DATABASE", text(&request.database.name)),
            (
                "AMQP_BUS_HOST",
                request.broker.host.clone().unwrap_or_else(|| self.bus_host.to_string()),
            ),
            ("BUS_ADDRESS_HOST", self.bus_host.to_string()),
            ("EYEOS_UNIX_USER", session.unix_user.clone()),
            ("SPICE_PASSWD", self.secret.as_str().to_string()),
            ("BUS_SUBSCRIPTION", subscription.address().to_string()),
            ("COMMAND_TO_EXECUTE", app_command.to_string()),
            ("AMQP_QUEUE", subscription.address().to_string()),
            ("EYEOS_USER", request.user.clone()),
            ("EYEOS_DOMAIN", request.domain.clone()),
            ("EYEOS_TOKEN", text(&request.token)),
            ("EYEOS_CARD", request.card.clone()),
            ("EYEOS_SIGNATURE", request.signature.clone()),
            ("EYEOS_MINI_CARD", text(&request.minicard)),
            ("EYEOS_MINI_SIGNATURE", text(&request.minisignature)),
            (
                "EYEOS_PRETTY_NAME",
                request.pretty_name.clone().unwrap_or_else(|| request.user.clone()),
            ),
            ("EMAIL_DOMAIN", request.email_domain.clone()),
            ("EYEOS_IMAP_HOST", text(&request.imap_host)),
            ("EYEOS_SMTP_HOST", text(&request.smtp_host)),
            ("USE_BIND_MOUNT_FOR_LIBRARIES", flag(&request.use_bind_mount_for_libraries)),
            ("ENABLE_LIBREOFFICE_AUTOSAVE", flag(&request.enable_libreoffice_autosave)),
            (
                "WEBDAV_HOST",
                request.webdav_host.clone().unwrap_or_else(|| self.bus_host.to_string()),
            ),
            ("SPICE_RES", resolution),
            ("EYEOS_BUS_MASTER_USER", text(&request.minicard)),
            ("EYEOS_BUS_MASTER_PASSWD", text(&request.minisignature)),
        ]
    }
}
