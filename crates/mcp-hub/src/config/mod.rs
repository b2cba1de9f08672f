//! Backend configuration: the input shape `ConnectionManager::add` accepts,
//! loaded from a TOML or JSON file and resolved against a
//! [`CredentialProvider`](crate::credential::CredentialProvider) before use.

pub mod id_generator;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::credential::CredentialProvider;
use crate::error::HubError;

/// Transport a backend is reached through.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    #[default]
    #[serde(alias = "stdio")]
    Stdio,
    #[serde(alias = "sse", alias = "httpSse")]
    HttpSse,
    #[serde(alias = "streamableHttp", alias = "streamable-http")]
    StreamableHttp,
}

/// One backend's configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendConfig {
    /// Unique name within a hub instance; also the input to `safeId`.
    pub name: String,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub auto_approve: Vec<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl BackendConfig {
    pub fn validate(&self) -> Result<(), HubError> {
        if self.name.trim().is_empty() {
            return Err(HubError::BackendNameEmpty(self.name.clone()));
        }
        match self.transport {
            TransportKind::Stdio => {
                if self.command.as_deref().unwrap_or_default().trim().is_empty() {
                    return Err(HubError::BackendCommandEmpty { id: self.name.clone() });
                }
            }
            TransportKind::HttpSse | TransportKind::StreamableHttp => {
                let url = self
                    .url
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| HubError::BackendUrlMissing { id: self.name.clone() })?;
                Url::parse(url).map_err(|source| HubError::BackendUrlInvalid {
                    id: self.name.clone(),
                    url: url.to_string(),
                    source,
                })?;
            }
        }
        Ok(())
    }

    /// Resolve every `${NAME}` reference in `env`, `headers`, `url` and
    /// `args` through `provider`.
    pub fn resolve_credentials(
        &self,
        provider: &dyn CredentialProvider,
    ) -> Result<BackendConfig, HubError> {
        let mut resolved = self.clone();
        for value in resolved.env.values_mut() {
            *value = crate::credential::expand(value, provider)?;
        }
        for value in resolved.headers.values_mut() {
            *value = crate::credential::expand(value, provider)?;
        }
        if let Some(url) = resolved.url.as_mut() {
            *url = crate::credential::expand(url, provider)?;
        }
        for arg in resolved.args.iter_mut() {
            *arg = crate::credential::expand(arg, provider)?;
        }
        Ok(resolved)
    }
}

/// A backend-configuration document: either `{name: BackendConfig}` pairs
/// (the natural map shape for a config file) or a bare list, accepted
/// untagged so both a wrapped and a direct server definition parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum BackendConfigDocument {
    Map(BTreeMap<String, BackendConfigEntry>),
    List(Vec<BackendConfig>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct BackendConfigEntry {
    #[serde(default)]
    transport: TransportKind,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    auto_approve: Vec<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

impl BackendConfigEntry {
    fn into_config(self, name: String) -> BackendConfig {
        BackendConfig {
            name,
            transport: self.transport,
            command: self.command,
            args: self.args,
            env: self.env,
            url: self.url,
            headers: self.headers,
            disabled: self.disabled,
            auto_approve: self.auto_approve,
            display_name: self.display_name,
            description: self.description,
        }
    }
}

/// Load a set of backend configs from a TOML or JSON file at `path`.
pub fn load_backend_configs(path: impl AsRef<Path>) -> Result<Vec<BackendConfig>, HubError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .map_err(|source| HubError::ReadConfig { path: path.to_path_buf(), source })?;
    let doc: BackendConfigDocument = if is_json_path(path) {
        serde_json::from_str(&content)
            .map_err(|source| HubError::ParseJson { path: path.to_path_buf(), source })?
    } else {
        toml_edit::de::from_str(&content)
            .map_err(|source| HubError::ParseToml { path: path.to_path_buf(), source })?
    };

    let configs = match doc {
        BackendConfigDocument::Map(map) => {
            map.into_iter().map(|(name, entry)| entry.into_config(name)).collect()
        }
        BackendConfigDocument::List(list) => list,
    };

    for config in &configs {
        config.validate()?;
    }
    Ok(configs)
}

fn is_json_path(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn parses_map_shaped_toml_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backends.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[fs]
command = "npx"
args = ["-y", "fs-server"]

[gh]
transport = "httpSse"
url = "https://example.com/sse"
"#
        )
        .unwrap();

        let configs = load_backend_configs(&path).unwrap();
        assert_eq!(configs.len(), 2);
        let fs = configs.iter().find(|c| c.name == "fs").unwrap();
        assert_eq!(fs.command.as_deref(), Some("npx"));
        let gh = configs.iter().find(|c| c.name == "gh").unwrap();
        assert_eq!(gh.transport, TransportKind::HttpSse);
    }

    #[test]
    fn rejects_missing_command_for_stdio() {
        let config = BackendConfig {
            name: "broken".into(),
            transport: TransportKind::Stdio,
            command: None,
            args: vec![],
            env: BTreeMap::new(),
            url: None,
            headers: BTreeMap::new(),
            disabled: false,
            auto_approve: vec![],
            display_name: None,
            description: None,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_invalid_url_for_remote_transport() {
        let config = BackendConfig {
            name: "remote".into(),
            transport: TransportKind::StreamableHttp,
            command: None,
            args: vec![],
            env: BTreeMap::new(),
            url: Some("not a url".into()),
            headers: BTreeMap::new(),
            disabled: false,
            auto_approve: vec![],
            display_name: None,
            description: None,
        };
        assert!(config.validate().is_err());
    }
}
