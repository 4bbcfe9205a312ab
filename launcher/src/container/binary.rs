//! Container runtime executable resolution

use std::path::Path;

use tracing::{debug, info};

/// Resolve the runtime executable name.
///
/// When `version` is set and `<install_dir>/<binary>-<version>` exists, the
/// versioned name is used; otherwise the generic `binary`. Filesystem errors
/// count as "not found".
pub async fn resolve_runtime_binary(install_dir: &Path, binary: &str, version: Option<&str>) -> String {
    let version = match version.map(str::trim) {
        Some(v) if !v.is_empty() => v,
        _ => {
            info!(binary = %binary, "No runtime version pinned, using generic binary");
            return binary.to_string();
        }
    };

    let versioned = format!("{}-{}", binary, version);
    let candidate = install_dir.join(&versioned);

    match tokio::fs::metadata(&candidate).await {
        Ok(_) => {
            info!(binary = %versioned, path = %candidate.display(), "Using versioned runtime binary");
            versioned
        }
        Err(e) => {
            debug!(path = %candidate.display(), error = %e, "Versioned runtime binary not found");
            info!(binary = %binary, "Using generic runtime binary");
            binary.to_string()
        }
    }
}
