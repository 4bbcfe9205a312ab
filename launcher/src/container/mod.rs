//! Container runtime module for the AppVM launcher
//!
//! Handles all interactions with the container runtime:
//! - Resolving which runtime executable is installed
//! - Selecting the image for an application
//! - Assembling the container run command
//! - Running it and resolving the published display port

mod binary;
mod command;
mod executor;
mod image;
mod port;

pub use binary::resolve_runtime_binary;
pub use command::{CommandBuilder, RuntimeInvocation};
pub use executor::{
    resolve_display_host, ProcessOutput, ProcessRunner, RuntimeExecutor, SessionEndpoint,
    TokioProcessRunner,
};
#[cfg(test)]
pub use executor::MockProcessRunner;
pub use image::{ImageSelector, SelectedImage};
pub use port::{parse_port_mapping, PortMapping};
