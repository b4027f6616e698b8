//! Per-user memory peer configuration files.
//!
//! Each peer is started with its own copy of the base template, with
//! `user_id` injected, at `<session_dir>/config_<user_id>.json`.
//!
//! A written file is owned by the session that wrote it: removal only
//! deletes the file if a later write has not replaced it.

use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::SessionError;
use crate::identity::UserId;

/// Where the config file for `user` lives.
pub fn session_config_path(session_dir: &Path, user: &UserId) -> PathBuf {
    session_dir.join(format!("config_{user}.json"))
}

/// Render the per-user config from the base template.
pub fn render_session_config(
    template: &str,
    user: &UserId,
) -> Result<serde_json::Value, SessionError> {
    let mut value: serde_json::Value = serde_json::from_str(template)
        .map_err(|e| SessionError::Config(format!("base config is not valid JSON: {e}")))?;

    let object = value
        .as_object_mut()
        .ok_or_else(|| SessionError::Config("base config must be a JSON object".into()))?;
    object.insert("user_id".into(), serde_json::Value::String(user.to_string()));

    Ok(value)
}

/// A config file written for one session.
///
/// Holds the file open so its identity cannot be reused while the session
/// lives.
#[derive(Debug)]
pub struct SessionConfigFile {
    path: PathBuf,
    handle: File,
}

impl SessionConfigFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file at `path` is still the one this session wrote.
    pub async fn is_current(&self) -> bool {
        let Ok(current) = tokio::fs::metadata(&self.path).await else {
            return false;
        };
        match self.handle.metadata() {
            Ok(ours) => same_file(&ours, &current),
            Err(_) => false,
        }
    }

    /// Delete the file unless another session has written over it.
    pub async fn remove(&self) {
        if !self.is_current().await {
            tracing::debug!(
                path = %self.path.display(),
                "Session config missing or replaced, leaving it"
            );
            return;
        }

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Session config removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove session config");
            }
        }
    }
}

#[cfg(unix)]
fn same_file(a: &std::fs::Metadata, b: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_file(a: &std::fs::Metadata, b: &std::fs::Metadata) -> bool {
    a.len() == b.len() && a.modified().ok() == b.modified().ok()
}

/// Write the config for `user` atomically.
pub async fn write_session_config(
    base_config: &Path,
    session_dir: &Path,
    user: &UserId,
) -> Result<SessionConfigFile, SessionError> {
    let template = tokio::fs::read_to_string(base_config).await.map_err(|e| {
        SessionError::Config(format!(
            "failed to read base config {}: {e}",
            base_config.display()
        ))
    })?;
    let rendered = render_session_config(&template, user)?;
    let body = serde_json::to_vec_pretty(&rendered)
        .map_err(|e| SessionError::Config(format!("failed to encode session config: {e}")))?;

    tokio::fs::create_dir_all(session_dir).await.map_err(|e| {
        SessionError::Config(format!(
            "failed to create session dir {}: {e}",
            session_dir.display()
        ))
    })?;

    let path = session_config_path(session_dir, user);
    let tmp = session_dir.join(format!(".config_{user}.{}.tmp", uuid::Uuid::new_v4()));

    if let Err(e) = tokio::fs::write(&tmp, &body).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(SessionError::Config(format!(
            "failed to write {}: {e}",
            tmp.display()
        )));
    }
    if let Err(e) = tokio::fs::rename(&tmp, &path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(SessionError::Config(format!(
            "failed to move session config into place at {}: {e}",
            path.display()
        )));
    }

    let handle = match tokio::fs::File::open(&path).await {
        Ok(file) => file.into_std().await,
        Err(e) => {
            return Err(SessionError::Config(format!(
                "failed to reopen {}: {e}",
                path.display()
            )))
        }
    };

    tracing::debug!(user_id = %user, path = %path.display(), "Session config written");
    Ok(SessionConfigFile { path, handle })
}
