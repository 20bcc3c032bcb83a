//! Configuration Management
//!
//! Reads connection settings from an OpenStack `clouds.yaml`, with `OS_*`
//! environment variables taking precedence over file values.

use crate::openstack::{AuthOptions, EndpointOpts, Interface, MicroversionTable};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("cloud '{0}' not found in any clouds.yaml")]
    CloudNotFound(String),

    #[error("no auth URL configured (set auth.auth_url in clouds.yaml or OS_AUTH_URL)")]
    MissingAuthUrl,

    #[error("invalid interface '{0}'")]
    InvalidInterface(String),
}

/// The `auth` section of a cloud entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudAuth {
    #[serde(default)]
    pub auth_url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub user_domain_name: Option<String>,
    #[serde(default)]
    pub user_domain_id: Option<String>,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub project_domain_name: Option<String>,
    #[serde(default)]
    pub project_domain_id: Option<String>,
    #[serde(default)]
    pub domain_name: Option<String>,
    #[serde(default)]
    pub domain_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub application_credential_id: Option<String>,
    #[serde(default)]
    pub application_credential_name: Option<String>,
    #[serde(default)]
    pub application_credential_secret: Option<String>,
}

/// One entry under `clouds:`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default)]
    pub auth: CloudAuth,
    #[serde(default)]
    pub region_name: Option<String>,
    #[serde(default)]
    pub interface: Option<String>,
    /// Supported microversion range per service type
    #[serde(default)]
    pub microversions: MicroversionTable,
    #[serde(default = "default_allow_reauth")]
    pub allow_reauth: bool,
}

fn default_allow_reauth() -> bool {
    true
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            auth: CloudAuth::default(),
            region_name: None,
            interface: None,
            microversions: MicroversionTable::default(),
            allow_reauth: default_allow_reauth(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CloudsFile {
    #[serde(default)]
    clouds: HashMap<String, CloudConfig>,
}

/// Effective configuration for one cloud
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Selected cloud, if any
    pub cloud_name: Option<String>,
    pub cloud: CloudConfig,
    /// The clouds.yaml the entry came from
    pub source: Option<PathBuf>,
}

impl Config {
    /// clouds.yaml locations, in lookup order
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(path) = std::env::var("OS_CLIENT_CONFIG_FILE") {
            paths.push(PathBuf::from(path));
        }
        paths.push(PathBuf::from("clouds.yaml"));
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("openstack").join("clouds.yaml"));
        }
        paths.push(PathBuf::from("/etc/openstack/clouds.yaml"));
        paths
    }

    /// Load from the standard locations and the process environment.
    /// `cloud` falls back to `$OS_CLOUD`.
    pub fn load(cloud: Option<&str>) -> Result<Self, ConfigError> {
        Self::load_with(cloud, &Self::search_paths(), |key| std::env::var(key).ok())
    }

    pub fn load_with(
        cloud: Option<&str>,
        paths: &[PathBuf],
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let name = cloud.map(str::to_string).or_else(|| env("OS_CLOUD"));

        let found = paths.iter().find(|p| p.is_file());
        let mut config = match found {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                Self::from_yaml(&content, name.as_deref(), path)?
            }
            None => match &name {
                Some(name) => return Err(ConfigError::CloudNotFound(name.clone())),
                None => Self::default(),
            },
        };

        config.apply_env(env)?;
        tracing::debug!(
            "Using cloud {:?} from {:?}",
            config.cloud_name,
            config.source
        );
        Ok(config)
    }

    /// Pick a cloud out of clouds.yaml content. Without a name, a file with
    /// exactly one cloud selects it.
    pub fn from_yaml(content: &str, cloud: Option<&str>, path: &Path) -> Result<Self, ConfigError> {
        let mut file: CloudsFile = serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let (cloud_name, entry) = match cloud {
            Some(name) => {
                let entry = file
                    .clouds
                    .remove(name)
                    .ok_or_else(|| ConfigError::CloudNotFound(name.to_string()))?;
                (Some(name.to_string()), entry)
            }
            None if file.clouds.len() == 1 => match file.clouds.into_iter().next() {
                Some((name, entry)) => (Some(name), entry),
                None => (None, CloudConfig::default()),
            },
            None => (None, CloudConfig::default()),
        };

        Ok(Self {
            cloud_name,
            cloud: entry,
            source: Some(path.to_path_buf()),
        })
    }

    /// Overlay `OS_*` variables onto the file values
    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let auth = &mut self.cloud.auth;
        let overrides: [(&str, &mut Option<String>); 16] = [
            ("OS_AUTH_URL", &mut auth.auth_url),
            ("OS_USERNAME", &mut auth.username),
            ("OS_USER_ID", &mut auth.user_id),
            ("OS_PASSWORD", &mut auth.password),
            ("OS_USER_DOMAIN_NAME", &mut auth.user_domain_name),
            ("OS_USER_DOMAIN_ID", &mut auth.user_domain_id),
            ("OS_PROJECT_NAME", &mut auth.project_name),
            ("OS_PROJECT_ID", &mut auth.project_id),
            ("OS_PROJECT_DOMAIN_NAME", &mut auth.project_domain_name),
            ("OS_PROJECT_DOMAIN_ID", &mut auth.project_domain_id),
            ("OS_DOMAIN_NAME", &mut auth.domain_name),
            ("OS_DOMAIN_ID", &mut auth.domain_id),
            ("OS_TOKEN", &mut auth.token),
            ("OS_APPLICATION_CREDENTIAL_ID", &mut auth.application_credential_id),
            ("OS_APPLICATION_CREDENTIAL_NAME", &mut auth.application_credential_name),
            ("OS_APPLICATION_CREDENTIAL_SECRET", &mut auth.application_credential_secret),
        ];
        for (key, slot) in overrides {
            if let Some(value) = env(key).filter(|v| !v.is_empty()) {
                *slot = Some(value);
            }
        }

        if let Some(region) = env("OS_REGION_NAME").filter(|v| !v.is_empty()) {
            self.cloud.region_name = Some(region);
        }
        if let Some(interface) = env("OS_INTERFACE").filter(|v| !v.is_empty()) {
            self.cloud.interface = Some(interface);
        }
        // Validate early so a typo fails before any network call
        self.interface()?;
        Ok(())
    }

    pub fn interface(&self) -> Result<Interface, ConfigError> {
        match &self.cloud.interface {
            Some(raw) => {
                Interface::parse_loose(raw).ok_or_else(|| ConfigError::InvalidInterface(raw.clone()))
            }
            None => Ok(Interface::default()),
        }
    }

    pub fn region(&self) -> Option<&str> {
        self.cloud.region_name.as_deref()
    }

    pub fn microversions(&self) -> &MicroversionTable {
        &self.cloud.microversions
    }

    /// Identity credentials for the selected cloud
    pub fn auth_options(&self) -> Result<AuthOptions, ConfigError> {
        let auth = &self.cloud.auth;
        let identity_endpoint = auth.auth_url.clone().ok_or(ConfigError::MissingAuthUrl)?;
        Ok(AuthOptions {
            identity_endpoint,
            user_id: auth.user_id.clone(),
            username: auth.username.clone(),
            password: auth.password.clone(),
            user_domain_id: auth.user_domain_id.clone(),
            user_domain_name: auth.user_domain_name.clone(),
            project_id: auth.project_id.clone(),
            project_name: auth.project_name.clone(),
            project_domain_id: auth.project_domain_id.clone(),
            project_domain_name: auth.project_domain_name.clone(),
            domain_id: auth.domain_id.clone(),
            domain_name: auth.domain_name.clone(),
            token_id: auth.token.clone(),
            application_credential_id: auth.application_credential_id.clone(),
            application_credential_name: auth.application_credential_name.clone(),
            application_credential_secret: auth.application_credential_secret.clone(),
            allow_reauth: self.cloud.allow_reauth,
        })
    }

    /// Endpoint lookup for `service_type` in the configured region/interface
    pub fn endpoint_opts(&self, service_type: &str) -> Result<EndpointOpts, ConfigError> {
        let mut opts = EndpointOpts::new(service_type).interface(self.interface()?);
        if let Some(region) = self.region() {
            opts = opts.region(region);
        }
        Ok(opts)
    }
}
