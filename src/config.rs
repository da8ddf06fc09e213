use crate::policy::RewritePolicy;
use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use regex::Regex;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::{env, fs};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Config {
    /// The address the metric endpoint binds to.
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    pub metrics_addr: SocketAddr,

    /// The address the health endpoint binds to.
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    pub health_addr: SocketAddr,

    /// Include a pull secret in the pod configuration if an image reference has been rewritten.
    /// Leave empty to disable pull secrets.
    #[arg(long, env = "PULL_SECRET", default_value = "")]
    pub pull_secret: String,

    /// The port the webhook endpoint binds to.
    #[arg(long, env = "LISTEN_PORT", default_value_t = 9443)]
    pub listen_port: u16,

    /// Policy file with `ignoreList` and `domainMap`.
    #[arg(
        long,
        env = "CONFIG_PATH",
        default_value = "/tmp/config/docker-proxy-config.yaml"
    )]
    pub config_path: PathBuf,

    /// Directory holding `tls.crt` and `tls.key` for the webhook endpoint.
    #[arg(
        long,
        env = "CERT_DIR",
        default_value = "/tmp/k8s-webhook-server/serving-certs"
    )]
    pub cert_dir: PathBuf,

    /// Serve the webhook endpoint over plain HTTP.
    #[arg(long, env = "DISABLE_TLS")]
    pub disable_tls: bool,

    /// Refuse to start when a domain is in both `ignoreList` and `domainMap`.
    #[arg(long, env = "REJECT_OVERLAPPING_DOMAINS")]
    pub reject_overlapping_domains: bool,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

impl Config {
    pub fn webhook_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.listen_port))
    }

    pub fn pull_secret(&self) -> Option<&str> {
        Some(self.pull_secret.as_str()).filter(|name| !name.is_empty())
    }

    pub fn tls_cert_path(&self) -> PathBuf {
        self.cert_dir.join("tls.crt")
    }

    pub fn tls_key_path(&self) -> PathBuf {
        self.cert_dir.join("tls.key")
    }
}

pub fn load_policy<P: AsRef<Path>>(path: P, reject_overlapping_domains: bool) -> Result<RewritePolicy> {
    info!("Loading policy from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let policy = RewritePolicy::from_yaml(expanded.as_bytes())
        .context("Failed to load policy after environment variable expansion")?;

    if reject_overlapping_domains {
        return policy
            .reject_overlaps()
            .context("Policy contains domains that are both mapped and ignored");
    }

    Ok(policy)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming every missing variable.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.push(var_name.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        bail!("Missing environment variable: {}", missing.join(", "));
    }

    Ok(result.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_expand_env_vars_success() {
        unsafe {
            env::set_var("TEST_MIRROR_HOST", "mirror.example.com");
        }
        let input = "docker.io: ${TEST_MIRROR_HOST}";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, "docker.io: mirror.example.com");
        unsafe {
            env::remove_var("TEST_MIRROR_HOST");
        }
    }

    #[test]
    fn test_expand_env_vars_missing_var() {
        let input = "This will fail: ${MISSING_VAR}";
        let err = expand_env_vars(input).unwrap_err();
        assert_eq!(err.to_string(), "Missing environment variable: MISSING_VAR");
    }

    #[test]
    fn test_expand_env_vars_multiple_vars() {
        unsafe {
            env::set_var("VAR1", "foo");
            env::set_var("VAR2", "bar");
        }
        let input = "${VAR1} and ${VAR2}";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, "foo and bar");
        unsafe {
            env::remove_var("VAR1");
            env::remove_var("VAR2");
        }
    }

    #[test]
    fn test_expand_env_vars_no_vars() {
        let input = "No variables here";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, input);
    }

    #[test]
    fn test_load_policy_file() {
        let yaml_content = r#"
        ignoreList:
          - quay.io
        domainMap:
          docker.io: mirror.example.com
        "#;

        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        let path = tmp_file.path();
        fs::write(path, yaml_content).expect("Failed to write to temp file");

        let policy = load_policy(path, false).expect("Should load policy");

        assert_eq!(policy.domain_map().len(), 1);
        assert!(policy.ignore_list().contains("quay.io"));
    }

    #[test]
    fn test_load_policy_file_rejects_overlap_when_strict() {
        let yaml_content = r#"
        ignoreList:
          - docker.io
        domainMap:
          docker.io: mirror.example.com
        "#;

        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        fs::write(tmp_file.path(), yaml_content).expect("Failed to write to temp file");

        assert!(load_policy(tmp_file.path(), false).is_ok());
        assert!(load_policy(tmp_file.path(), true).is_err());
    }

    #[test]
    fn test_load_policy_missing_file() {
        let err = load_policy("/nonexistent/docker-proxy-config.yaml", false).unwrap_err();
        assert!(err.to_string().starts_with("Failed to read config file"));
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::parse_from(["docker-proxy-webhook"]);
        assert_eq!(config.listen_port, 9443);
        assert_eq!(config.metrics_addr, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.pull_secret(), None);
        assert_eq!(
            config.tls_cert_path(),
            PathBuf::from("/tmp/k8s-webhook-server/serving-certs/tls.crt")
        );

        let config = Config::parse_from(["docker-proxy-webhook", "--pull-secret", "regcred"]);
        assert_eq!(config.pull_secret(), Some("regcred"));
    }
}
