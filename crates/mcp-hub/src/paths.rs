//! Filesystem layout for the hub process: where its backend config file,
//! event log and runtime state live.

use std::{env, path::PathBuf};

use crate::error::HubError;

const ROOT_ENV_KEY: &str = "MCP_HUB_ROOT";
const DEFAULT_ROOT_DIRNAME: &str = ".mcp-hub";

/// Descriptor for the on-disk directory structure of one hub instance.
#[derive(Clone, Debug)]
pub struct Layout {
    root: PathBuf,
    logs_dir: PathBuf,
    state_dir: PathBuf,
}

impl Layout {
    pub fn new(root: PathBuf) -> Self {
        let logs_dir = root.join("logs");
        let state_dir = root.join("state");
        Self { root, logs_dir, state_dir }
    }

    pub fn ensure(&self) -> Result<(), HubError> {
        for dir in [self.root(), self.logs_dir(), self.state_dir()] {
            if !dir.exists() {
                std::fs::create_dir_all(dir)
                    .map_err(|source| HubError::CreateDirectory { path: dir.to_path_buf(), source })?;
            }
        }
        Ok(())
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// Directory the event sink appends its daily JSONL files to.
    pub fn logs_dir(&self) -> &std::path::Path {
        &self.logs_dir
    }

    /// Directory for future runtime state (currently unused at rest; the
    /// hub keeps all connection/session state in memory).
    pub fn state_dir(&self) -> &std::path::Path {
        &self.state_dir
    }

    pub fn backend_config_path(&self) -> PathBuf {
        self.root.join("backends.toml")
    }
}

/// Default root directory: `$MCP_HUB_ROOT`, falling back to `~/.mcp-hub`.
pub fn default_root() -> Result<PathBuf, HubError> {
    if let Ok(value) = env::var(ROOT_ENV_KEY) {
        if !value.trim().is_empty() {
            return Ok(PathBuf::from(value));
        }
    }
    let home = user_home_dir().ok_or(HubError::HomeDirectoryUnknown)?;
    Ok(home.join(DEFAULT_ROOT_DIRNAME))
}

fn user_home_dir() -> Option<PathBuf> {
    if let Ok(home) = env::var("HOME") {
        if !home.is_empty() {
            return Some(PathBuf::from(home));
        }
    }
    if let Ok(profile) = env::var("USERPROFILE") {
        if !profile.is_empty() {
            return Some(PathBuf::from(profile));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_derives_expected_subdirectories() {
        let layout = Layout::new(PathBuf::from("/tmp/example-hub"));
        assert_eq!(layout.logs_dir(), std::path::Path::new("/tmp/example-hub/logs"));
        assert_eq!(layout.state_dir(), std::path::Path::new("/tmp/example-hub/state"));
    }
}
