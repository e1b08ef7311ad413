use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::recorder::keys::event_timestamp;

/// Best-effort audit trail of recording start/stop events.
///
/// Opened once at startup; if the file cannot be opened for appending the log
/// is disabled for the rest of the run. Write failures are swallowed.
pub struct EventLog {
    path: Option<PathBuf>,
}

impl EventLog {
    pub async fn open(path: &Path) -> Self {
        match OpenOptions::new().create(true).append(true).open(path).await {
            Ok(_) => {
                info!(path = path.display().to_string(), "event log enabled");
                Self {
                    path: Some(path.to_path_buf()),
                }
            }
            Err(e) => {
                let hint = match e.kind() {
                    std::io::ErrorKind::PermissionDenied => "check permissions",
                    std::io::ErrorKind::NotFound => "check that the directory exists",
                    _ => "check the path",
                };
                warn!(
                    path = path.display().to_string(),
                    error = %e,
                    "unable to open event log, {hint}; event logging disabled"
                );
                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    #[allow(dead_code)]
    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    /// Append `[HH:MM:SS DD-MM-YYYY] message`.
    pub async fn record(&self, message: &str) {
        let Some(path) = &self.path else {
            return;
        };
        let line = format!("[{}] {message}\n", event_timestamp(&chrono::Local::now()));
        if let Err(e) = append(path, &line).await {
            debug!(path = path.display().to_string(), error = %e, "event log write failed");
        }
    }
}

async fn append(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}
