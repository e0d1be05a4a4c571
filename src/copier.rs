//! The actual transfer of an image between registries.

use std::fmt;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use base64::engine::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::CopyError;
use crate::image::Image;

/// Destination account. The password never shows up in debug output.
#[derive(Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn is_complete(&self) -> bool {
        !self.user.is_empty() && !self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Credentials for one registry in the containers `auth.json` format.
pub fn auth_config(registry: &str, credentials: &Credentials) -> serde_json::Value {
    let auth = STANDARD.encode(format!("{}:{}", credentials.user, credentials.password));
    json!({ "auths": { registry: { "auth": auth } } })
}

/// An `auth.json` only the current user can read, removed on drop.
pub struct AuthFile {
    file: NamedTempFile,
}

impl AuthFile {
    pub fn write(registry: &str, credentials: &Credentials) -> std::io::Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("imgsync-auth-")
            .suffix(".json")
            .tempfile()?;
        serde_json::to_writer(&mut file, &auth_config(registry, credentials))?;
        file.flush()?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Copies every platform of `source` to `destination`. Dropping the future
/// aborts the copy.
#[async_trait]
pub trait Copier: Send + Sync {
    async fn copy(
        &self,
        source: &Image,
        destination: &Image,
        credentials: &Credentials,
    ) -> Result<(), CopyError>;
}

/// Shells out to `skopeo copy --all`.
#[derive(Debug, Clone)]
pub struct SkopeoCopier {
    program: String,
}

impl SkopeoCopier {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Credentials only ever reach skopeo through `auth_file`, never argv.
    pub fn args(source: &Image, destination: &Image, auth_file: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            "copy".to_string(),
            "--all".to_string(),
            "--retry-times".to_string(),
            "0".to_string(),
        ];

        if let Some(path) = auth_file {
            args.push("--dest-authfile".to_string());
            args.push(path.display().to_string());
        }

        args.push(format!("docker://{source}"));
        args.push(format!("docker://{destination}"));
        args
    }
}

impl Default for SkopeoCopier {
    fn default() -> Self {
        Self::new("skopeo")
    }
}

#[async_trait]
impl Copier for SkopeoCopier {
    async fn copy(
        &self,
        source: &Image,
        destination: &Image,
        credentials: &Credentials,
    ) -> Result<(), CopyError> {
        info!("Copier: syncing {source} => {destination}");

        let auth_file = match credentials.is_complete() {
            true => Some(
                AuthFile::write(&destination.repo, credentials).map_err(CopyError::AuthFile)?,
            ),
            false => None,
        };

        let output = Command::new(&self.program)
            .args(Self::args(
                source,
                destination,
                auth_file.as_ref().map(AuthFile::path),
            ))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(CopyError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        debug!(
            "Copier: {source} done: {}",
            String::from_utf8_lossy(&output.stdout).trim()
        );

        Ok(())
    }
}
