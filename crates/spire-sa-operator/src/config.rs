//! Operator configuration
//!
//! Everything the operator used to hard-code (registry address, the location of
//! the cluster metadata ConfigMap and admin credential Secret, annotation and
//! finalizer keys, retry delays) lives here. Configuration is read from an
//! optional YAML file and then overridden from the environment.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Environment variable naming an optional YAML configuration file
pub const CONFIG_PATH_ENV: &str = "SPIRE_SA_OPERATOR_CONFIG";

/// Well-known keys used on cluster objects
pub mod annotations {
    /// Opt-in annotation - must be "true" for the operator to act
    pub const MANAGED: &str = "omegahome.net/managed-spire";
    /// Registry entry id recorded after a successful registration
    pub const ENTRY_ID: &str = "omegahome.net/svid-entry-id";
    /// Finalizer guarding revocation of the registry entry
    pub const FINALIZER: &str = "omegahome.net/spire-finalizer";
    /// Written before the registry create call; cleared with the entry id
    pub const REGISTRATION_PENDING: &str = "omegahome.net/spire-registration-pending";
    /// Trust domain annotation on the cluster metadata ConfigMap
    pub const TRUST_DOMAIN: &str = "omega.k8s.io/spire-trustdomain";
}

/// Default values for the remaining settings
pub mod defaults {
    pub const REGISTRY_PORT: u16 = 8080;
    pub const REGISTRY_SCHEME: &str = "http";
    pub const REQUEST_TIMEOUT_SECS: u64 = 30;

    pub const CLUSTER_METADATA_NAMESPACE: &str = "kube-system";
    pub const CLUSTER_METADATA_NAME: &str = "kubeadm-config";
    pub const CLUSTER_METADATA_KEY: &str = "ClusterConfiguration";

    pub const ADMIN_CREDENTIAL_NAMESPACE: &str = "kube-system";
    pub const ADMIN_CREDENTIAL_NAME: &str = "admin-kubeconfig";
    pub const ADMIN_CREDENTIAL_KEY: &str = "kubeconfig";

    pub const RETRY_DELAY_SECS: u64 = 15;
    pub const CONFIGURATION_RETRY_DELAY_SECS: u64 = 60;
    pub const RECONCILE_TIMEOUT_SECS: u64 = 60;

    pub const HEALTH_PORT: u16 = 8081;
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Serialize a `Duration` as whole seconds.
///
/// Field names using this carry a `Seconds` suffix so the unit is never implied.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Registry connection settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryConfig {
    /// Registry hostname, no scheme
    pub host: String,
    /// Registry port; `None` or 0 leaves the port off the URL
    pub port: Option<u16>,
    /// URL scheme (`http` or `https`)
    pub scheme: String,
    /// Timeout applied to every registry request
    #[serde(rename = "requestTimeoutSeconds", with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: Some(defaults::REGISTRY_PORT),
            scheme: defaults::REGISTRY_SCHEME.to_string(),
            request_timeout: Duration::from_secs(defaults::REQUEST_TIMEOUT_SECS),
        }
    }
}

impl RegistryConfig {
    /// Base URL of the registration API, e.g. `http://spire-api:8080`
    pub fn base_url(&self) -> String {
        match self.port {
            Some(port) if port > 0 => format!("{}://{}:{}", self.scheme, self.host, port),
            _ => format!("{}://{}", self.scheme, self.host),
        }
    }
}

/// Location of the ConfigMap describing the cluster
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterMetadataRef {
    pub namespace: String,
    pub name: String,
    /// Data key holding the YAML cluster configuration
    pub data_key: String,
    /// Annotation holding the trust domain
    pub trust_domain_annotation: String,
}

impl Default for ClusterMetadataRef {
    fn default() -> Self {
        Self {
            namespace: defaults::CLUSTER_METADATA_NAMESPACE.to_string(),
            name: defaults::CLUSTER_METADATA_NAME.to_string(),
            data_key: defaults::CLUSTER_METADATA_KEY.to_string(),
            trust_domain_annotation: annotations::TRUST_DOMAIN.to_string(),
        }
    }
}

/// Location of the Secret holding the admin credential bundle
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
    pub data_key: String,
}

impl Default for SecretRef {
    fn default() -> Self {
        Self {
            namespace: defaults::ADMIN_CREDENTIAL_NAMESPACE.to_string(),
            name: defaults::ADMIN_CREDENTIAL_NAME.to_string(),
            data_key: defaults::ADMIN_CREDENTIAL_KEY.to_string(),
        }
    }
}

/// Annotation and finalizer keys placed on ServiceAccounts
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct IdentityKeys {
    pub managed: String,
    pub entry_id: String,
    pub finalizer: String,
    pub registration_pending: String,
}

impl Default for IdentityKeys {
    fn default() -> Self {
        Self {
            managed: annotations::MANAGED.to_string(),
            entry_id: annotations::ENTRY_ID.to_string(),
            finalizer: annotations::FINALIZER.to_string(),
            registration_pending: annotations::REGISTRATION_PENDING.to_string(),
        }
    }
}

/// Requeue delays handed to the controller after a failed reconcile
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Delay after transport, protocol and persistence failures
    #[serde(rename = "retryDelaySeconds", with = "duration_secs")]
    pub retry_delay: Duration,
    /// Delay after configuration failures, which need an operator to fix
    #[serde(rename = "configurationRetryDelaySeconds", with = "duration_secs")]
    pub configuration_retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(defaults::RETRY_DELAY_SECS),
            configuration_retry_delay: Duration::from_secs(
                defaults::CONFIGURATION_RETRY_DELAY_SECS,
            ),
        }
    }
}

/// Complete operator configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct OperatorConfig {
    pub registry: RegistryConfig,
    pub cluster_metadata: ClusterMetadataRef,
    pub admin_credential: SecretRef,
    pub keys: IdentityKeys,
    pub retry: RetryPolicy,
    /// Upper bound on a single reconcile, including every API call it makes
    #[serde(rename = "reconcileTimeoutSeconds", with = "duration_secs")]
    pub reconcile_timeout: Duration,
    pub health_port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            cluster_metadata: ClusterMetadataRef::default(),
            admin_credential: SecretRef::default(),
            keys: IdentityKeys::default(),
            retry: RetryPolicy::default(),
            reconcile_timeout: Duration::from_secs(defaults::RECONCILE_TIMEOUT_SECS),
            health_port: defaults::HEALTH_PORT,
        }
    }
}

impl OperatorConfig {
    /// Parse configuration from a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    /// Load configuration for the running process.
    ///
    /// Starts from the file named by `SPIRE_SA_OPERATOR_CONFIG` (or defaults),
    /// applies environment overrides and validates the result.
    ///
    /// Environment variables:
    /// - `SPIRE_API_HOST`: registry hostname
    /// - `SPIRE_API_PORT`: registry port (0 to omit)
    /// - `SPIRE_API_SCHEME`: `http` or `https`
    /// - `SPIRE_API_TIMEOUT`: request timeout in seconds
    /// - `RETRY_DELAY`: requeue delay in seconds after a failure
    /// - `CONFIGURATION_RETRY_DELAY`: requeue delay in seconds after a configuration failure
    /// - `RECONCILE_TIMEOUT`: per-reconcile deadline in seconds
    /// - `HEALTH_PORT`: port for the probe server
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(Path::new(&path))?,
            _ => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Override settings from environment variables
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("SPIRE_API_HOST") {
            self.registry.host = host;
        }
        if let Ok(scheme) = std::env::var("SPIRE_API_SCHEME") {
            self.registry.scheme = scheme;
        }
        if let Some(port) = parse_env::<u16>("SPIRE_API_PORT") {
            self.registry.port = Some(port);
        }
        self.registry.request_timeout =
            parse_duration_env("SPIRE_API_TIMEOUT", self.registry.request_timeout);
        self.retry.retry_delay = parse_duration_env("RETRY_DELAY", self.retry.retry_delay);
        self.retry.configuration_retry_delay = parse_duration_env(
            "CONFIGURATION_RETRY_DELAY",
            self.retry.configuration_retry_delay,
        );
        self.reconcile_timeout = parse_duration_env("RECONCILE_TIMEOUT", self.reconcile_timeout);
        if let Some(port) = parse_env::<u16>("HEALTH_PORT") {
            self.health_port = port;
        }
    }

    /// Reject configurations the operator cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("registry.host", &self.registry.host),
            ("registry.scheme", &self.registry.scheme),
            ("clusterMetadata.namespace", &self.cluster_metadata.namespace),
            ("clusterMetadata.name", &self.cluster_metadata.name),
            ("clusterMetadata.dataKey", &self.cluster_metadata.data_key),
            (
                "clusterMetadata.trustDomainAnnotation",
                &self.cluster_metadata.trust_domain_annotation,
            ),
            ("adminCredential.namespace", &self.admin_credential.namespace),
            ("adminCredential.name", &self.admin_credential.name),
            ("adminCredential.dataKey", &self.admin_credential.data_key),
            ("keys.managed", &self.keys.managed),
            ("keys.entryId", &self.keys.entry_id),
            ("keys.finalizer", &self.keys.finalizer),
            ("keys.registrationPending", &self.keys.registration_pending),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{field} cannot be empty")));
            }
        }

        let host = &self.registry.host;
        if host.contains("://") {
            return Err(ConfigError::Invalid(
                "registry.host must not include a scheme".to_string(),
            ));
        }
        if host.contains('/') {
            return Err(ConfigError::Invalid(
                "registry.host must not include a path".to_string(),
            ));
        }
        // Bracketed IPv6 literals are the only hosts allowed to contain ':'
        let ipv6_literal = host.starts_with('[') && host.ends_with(']');
        if host.contains(':') && !ipv6_literal {
            return Err(ConfigError::Invalid(
                "registry.host must not include a port; use registry.port".to_string(),
            ));
        }

        let durations = [
            ("registry.requestTimeoutSeconds", self.registry.request_timeout),
            ("retry.retryDelaySeconds", self.retry.retry_delay),
            (
                "retry.configurationRetryDelaySeconds",
                self.retry.configuration_retry_delay,
            ),
            ("reconcileTimeoutSeconds", self.reconcile_timeout),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{field} must be positive")));
            }
        }

        if self.retry.configuration_retry_delay < self.retry.retry_delay {
            return Err(ConfigError::Invalid(format!(
                "configurationRetryDelaySeconds ({:?}) must not be shorter than retryDelaySeconds ({:?})",
                self.retry.configuration_retry_delay, self.retry.retry_delay
            )));
        }

        Ok(())
    }
}

/// Parse a value from an environment variable, warning and ignoring bad input.
fn parse_env<T: std::str::FromStr>(var_name: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let value = std::env::var(var_name).ok()?;
    match value.parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(
                env_var = var_name,
                value = %value,
                error = %e,
                "Failed to parse env var, keeping configured value"
            );
            None
        }
    }
}

/// Parse a duration in seconds from an environment variable.
fn parse_duration_env(var_name: &str, current: Duration) -> Duration {
    parse_env::<u64>(var_name)
        .map(Duration::from_secs)
        .unwrap_or(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ENV_VARS: [&str; 9] = [
        CONFIG_PATH_ENV,
        "SPIRE_API_HOST",
        "SPIRE_API_PORT",
        "SPIRE_API_SCHEME",
        "SPIRE_API_TIMEOUT",
        "RETRY_DELAY",
        "CONFIGURATION_RETRY_DELAY",
        "RECONCILE_TIMEOUT",
        "HEALTH_PORT",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
registry:
  host: spire-api.spire-system.svc
  port: 9090
  requestTimeoutSeconds: 5
clusterMetadata:
  namespace: cluster-info
  name: cluster
  dataKey: config.yaml
  trustDomainAnnotation: example.org/trust-domain
keys:
  managed: example.org/managed
retry:
  retryDelaySeconds: 10
  configurationRetryDelaySeconds: 120
reconcileTimeoutSeconds: 45
"#;
        let config = OperatorConfig::from_yaml(yaml).expect("test YAML should parse successfully");
        assert_eq!(config.registry.host, "spire-api.spire-system.svc");
        assert_eq!(config.registry.port, Some(9090));
        assert_eq!(config.registry.request_timeout, Duration::from_secs(5));
        assert_eq!(config.cluster_metadata.name, "cluster");
        assert_eq!(config.cluster_metadata.data_key, "config.yaml");
        assert_eq!(config.keys.managed, "example.org/managed");
        // Unset keys keep their defaults
        assert_eq!(config.keys.entry_id, annotations::ENTRY_ID);
        assert_eq!(config.admin_credential.name, defaults::ADMIN_CREDENTIAL_NAME);
        assert_eq!(config.retry.retry_delay, Duration::from_secs(10));
        assert_eq!(
            config.retry.configuration_retry_delay,
            Duration::from_secs(120)
        );
        assert_eq!(config.reconcile_timeout, Duration::from_secs(45));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::default();
        assert_eq!(config.registry.port, Some(8080));
        assert_eq!(config.cluster_metadata.namespace, "kube-system");
        assert_eq!(config.cluster_metadata.name, "kubeadm-config");
        assert_eq!(config.cluster_metadata.data_key, "ClusterConfiguration");
        assert_eq!(config.admin_credential.data_key, "kubeconfig");
        assert_eq!(config.retry.retry_delay, Duration::from_secs(15));
    }

    #[test]
    fn test_base_url() {
        let mut registry = RegistryConfig {
            host: "spire-api".to_string(),
            ..Default::default()
        };
        assert_eq!(registry.base_url(), "http://spire-api:8080");

        registry.port = None;
        assert_eq!(registry.base_url(), "http://spire-api");

        registry.port = Some(0);
        registry.scheme = "https".to_string();
        assert_eq!(registry.base_url(), "https://spire-api");
    }

    #[test]
    fn test_validate_requires_host() {
        let config = OperatorConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("registry.host"));
    }

    #[test]
    fn test_validate_rejects_scheme_in_host() {
        let mut config = OperatorConfig::default();
        config.registry.host = "http://spire-api".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("scheme"));
    }

    #[test]
    fn test_validate_rejects_path_and_port_in_host() {
        for (host, expected) in [
            ("spire-api/v1", "path"),
            ("spire-api.spire-system.svc/", "path"),
            ("spire-api:9090", "port"),
            ("::1", "port"),
        ] {
            let mut config = OperatorConfig::default();
            config.registry.host = host.to_string();
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains(expected), "{host}: {err}");
        }
    }

    #[test]
    fn test_validate_accepts_bracketed_ipv6_host() {
        let mut config = OperatorConfig::default();
        config.registry.host = "[fd00::10]".to_string();
        assert!(config.validate().is_ok());
        assert_eq!(config.registry.base_url(), "http://[fd00::10]:8080");
    }

    #[test]
    fn test_validate_requires_registration_pending_key() {
        let mut config = OperatorConfig::default();
        config.registry.host = "spire-api".to_string();
        config.keys.registration_pending = String::new();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("keys.registrationPending"));
    }

    #[test]
    fn test_validate_rejects_short_configuration_delay() {
        let mut config = OperatorConfig::default();
        config.registry.host = "spire-api".to_string();
        config.retry.retry_delay = Duration::from_secs(30);
        config.retry.configuration_retry_delay = Duration::from_secs(10);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("configurationRetryDelaySeconds"));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = OperatorConfig::default();
        config.registry.host = "spire-api".to_string();
        config.reconcile_timeout = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("reconcileTimeoutSeconds"));
    }

    #[test]
    #[serial]
    fn test_load_from_env() {
        clear_env();
        std::env::set_var("SPIRE_API_HOST", "spire-api.example.net");
        std::env::set_var("SPIRE_API_PORT", "8443");
        std::env::set_var("SPIRE_API_SCHEME", "https");
        std::env::set_var("RETRY_DELAY", "20");
        std::env::set_var("RECONCILE_TIMEOUT", "90");

        let config = OperatorConfig::load().unwrap();
        assert_eq!(config.registry.base_url(), "https://spire-api.example.net:8443");
        assert_eq!(config.retry.retry_delay, Duration::from_secs(20));
        assert_eq!(config.reconcile_timeout, Duration::from_secs(90));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_load_ignores_invalid_env_values() {
        clear_env();
        std::env::set_var("SPIRE_API_HOST", "spire-api");
        std::env::set_var("RETRY_DELAY", "fifteen");
        std::env::set_var("SPIRE_API_PORT", "not-a-port");

        let config = OperatorConfig::load().unwrap();
        assert_eq!(config.retry.retry_delay, Duration::from_secs(15));
        assert_eq!(config.registry.port, Some(8080));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_load_without_host_fails() {
        clear_env();
        assert!(OperatorConfig::load().is_err());
    }
}
