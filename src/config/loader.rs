use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::ControllerConfig;

/// Prefix of environment variables overriding file values, e.g.
/// `KINGRESS_CLUSTER__NAMESPACE=ingress`.
pub const ENV_PREFIX: &str = "KINGRESS";

/// Load configuration from an optional file (YAML, JSON or TOML, chosen by
/// extension) overlaid with `KINGRESS_*` environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<ControllerConfig> {
    load_config_with_env(config_path, Environment::with_prefix(ENV_PREFIX))
}

fn load_config_with_env(config_path: Option<&str>, env: Environment) -> Result<ControllerConfig> {
    let mut builder = Config::builder();

    if let Some(config_path) = config_path {
        let path = Path::new(config_path);
        let format = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => FileFormat::Json,
            Some("toml") => FileFormat::Toml,
            _ => FileFormat::Yaml,
        };
        builder = builder.add_source(File::new(config_path, format));
    }

    let settings = builder
        .add_source(
            env.prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("dummy_hosts")
                .try_parsing(true),
        )
        .build()
        .with_context(|| match config_path {
            Some(path) => format!("Failed to build config from {path}"),
            None => "Failed to build config from environment".to_string(),
        })?;

    settings
        .try_deserialize()
        .context("Failed to deserialize controller configuration")
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, io::Write, time::Duration};

    use tempfile::Builder;

    use super::*;

    fn no_env() -> Environment {
        Environment::with_prefix(ENV_PREFIX).source(Some(HashMap::new()))
    }

    #[test]
    fn test_defaults_without_file() {
        let config = load_config_with_env(None, no_env()).unwrap();
        assert_eq!(config, ControllerConfig::default());
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            r#"
http_addr: "127.0.0.1:8080"
reconcile:
  interval: 5s
cluster:
  ingress_class: edge
  service_name: kingress
dummy_hosts: ["localhost"]
"#
        )
        .unwrap();

        let config = load_config_with_env(file.path().to_str(), no_env()).unwrap();
        assert_eq!(config.http_addr, "127.0.0.1:8080");
        assert_eq!(config.reconcile.interval, Duration::from_secs(5));
        assert_eq!(config.cluster.ingress_class, "edge");
        assert_eq!(config.cluster.service_name.as_deref(), Some("kingress"));
        assert_eq!(config.dummy_hosts, vec!["localhost".to_string()]);
        assert_eq!(config.https_addr, "0.0.0.0:443");
    }

    #[test]
    fn test_load_toml_file() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[proxy]
timeout = "30s"

[logging]
format = "pretty"
"#
        )
        .unwrap();

        let config = load_config_with_env(file.path().to_str(), no_env()).unwrap();
        assert_eq!(config.proxy.timeout, Duration::from_secs(30));
        assert_eq!(config.logging.format, crate::config::models::LogFormat::Pretty);
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut file = Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(file, "cluster:\n  namespace: from-file\n").unwrap();

        let env = Environment::with_prefix(ENV_PREFIX).source(Some(
            [
                ("KINGRESS_CLUSTER__NAMESPACE".to_string(), "from-env".to_string()),
                ("KINGRESS_DUMMY_HOSTS".to_string(), "localhost,callback.local".to_string()),
            ]
            .into_iter()
            .collect(),
        ));

        let config = load_config_with_env(file.path().to_str(), env).unwrap();
        assert_eq!(config.cluster.namespace, "from-env");
        assert_eq!(config.dummy_hosts, vec!["localhost", "callback.local"]);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(load_config_with_env(Some("/nonexistent/kingress.yaml"), no_env()).is_err());
    }
}
