//! Configuration for ampctl.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (AMPCTL_HOME, AMPCTL_TOPOLOGY, AMPCTL_JOURNAL_DIR)
//! 2. Config file (.ampctl/config.yaml)
//! 3. Defaults (~/.ampctl)
//!
//! Config file discovery:
//! - Searches current directory and parents for .ampctl/config.yaml
//! - Paths in config file are relative to the .ampctl/ directory
//!
//! There is no global instance: `load_config` returns a value that callers
//! hand to the orchestrator, and from there to every flow and task.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::RetryPolicy;
use crate::domain::{AgentTimeouts, Topology};

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(flatten)]
    pub controller: ControllerConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .ampctl/)
    pub home: Option<String>,
    /// Flow journal directory (relative to .ampctl/); journaling is off when unset
    pub journal_dir: Option<String>,
}

/// Settings consumed by flows and tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub controller_worker: ControllerWorkerSettings,
    pub haproxy_amphora: HaproxyAmphoraSettings,
    pub networking: NetworkingSettings,
    pub health_manager: HealthManagerSettings,
    pub amphora_agent: AmphoraAgentSettings,
    pub certificates: CertificateSettings,
    /// Applied to network plugging tasks that fail transiently
    pub task_retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerWorkerSettings {
    pub loadbalancer_topology: Topology,
    pub amp_image_tag: String,
    pub amp_flavor_id: String,
    pub amp_boot_network_list: Vec<String>,
    pub amp_active_retries: u32,
    pub amp_active_wait_sec: u64,
    pub enable_anti_affinity: bool,
    pub anti_affinity_policy: String,
}

impl Default for ControllerWorkerSettings {
    fn default() -> Self {
        Self {
            loadbalancer_topology: Topology::Single,
            amp_image_tag: "amphora".to_string(),
            amp_flavor_id: "amphora-flavor".to_string(),
            amp_boot_network_list: vec!["lb-mgmt-net".to_string()],
            amp_active_retries: 30,
            amp_active_wait_sec: 10,
            enable_anti_affinity: false,
            anti_affinity_policy: "anti-affinity".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HaproxyAmphoraSettings {
    pub connection_max_retries: u32,
    pub connection_retry_interval: u64,
    pub active_connection_max_retries: u32,
    pub active_connection_retry_interval: u64,
    pub rest_request_conn_timeout: u64,
    pub rest_request_read_timeout: u64,
    pub agent_scheme: String,
    pub bind_host: String,
    pub bind_port: u16,
    pub base_path: String,
    pub base_cert_dir: String,
    pub haproxy_cmd: String,
    pub respawn_count: u32,
    pub respawn_interval: u32,
    pub use_upstart: bool,
}

impl Default for HaproxyAmphoraSettings {
    fn default() -> Self {
        Self {
            connection_max_retries: 120,
            connection_retry_interval: 5,
            active_connection_max_retries: 15,
            active_connection_retry_interval: 2,
            rest_request_conn_timeout: 10,
            rest_request_read_timeout: 60,
            agent_scheme: "https".to_string(),
            bind_host: "0.0.0.0".to_string(),
            bind_port: 9443,
            base_path: "/var/lib/octavia".to_string(),
            base_cert_dir: "/var/lib/octavia/certs".to_string(),
            haproxy_cmd: "/usr/sbin/haproxy".to_string(),
            respawn_count: 2,
            respawn_interval: 2,
            use_upstart: true,
        }
    }
}

impl HaproxyAmphoraSettings {
    /// Budget for amphorae still booting.
    pub fn connection_timeouts(&self) -> AgentTimeouts {
        AgentTimeouts {
            max_retries: self.connection_max_retries,
            retry_interval_secs: self.connection_retry_interval,
        }
    }

    /// Shorter budget used during failover, where an amphora may be dead.
    pub fn active_timeouts(&self) -> AgentTimeouts {
        AgentTimeouts {
            max_retries: self.active_connection_max_retries,
            retry_interval_secs: self.active_connection_retry_interval,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkingSettings {
    pub port_detach_timeout: u64,
    pub retry_interval: u64,
}

impl Default for NetworkingSettings {
    fn default() -> Self {
        Self {
            port_detach_timeout: 300,
            retry_interval: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthManagerSettings {
    pub controller_ip_port_list: Vec<String>,
    pub heartbeat_interval: u32,
    pub heartbeat_key: Option<String>,
}

impl Default for HealthManagerSettings {
    fn default() -> Self {
        Self {
            controller_ip_port_list: Vec::new(),
            heartbeat_interval: 10,
            heartbeat_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmphoraAgentSettings {
    pub agent_server_ca: String,
    pub agent_server_cert: String,
    pub agent_server_network_dir: String,
    pub agent_request_read_timeout: u32,
    pub agent_tls_protocol: String,
    pub amphora_udp_driver: String,
    pub administrative_log_facility: u8,
    pub user_log_facility: u8,
}

impl Default for AmphoraAgentSettings {
    fn default() -> Self {
        Self {
            agent_server_ca: "/etc/octavia/certs/client_ca.pem".to_string(),
            agent_server_cert: "/etc/octavia/certs/server.pem".to_string(),
            agent_server_network_dir: "/etc/netns/amphora-haproxy/network/interfaces.d/"
                .to_string(),
            agent_request_read_timeout: 180,
            agent_tls_protocol: "TLSv1.2".to_string(),
            amphora_udp_driver: "keepalived_lvs".to_string(),
            administrative_log_facility: 1,
            user_log_facility: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateSettings {
    pub cert_validity_days: u32,
}

impl Default for CertificateSettings {
    fn default() -> Self {
        Self {
            cert_validity_days: 730,
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// State directory
    pub home: PathBuf,
    /// Where flow journals go, if journaling is on
    pub journal_dir: Option<PathBuf>,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub controller: ControllerConfig,
}

/// Environment overrides, read once so resolution stays testable.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub home: Option<String>,
    pub topology: Option<String>,
    pub journal_dir: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            home: std::env::var("AMPCTL_HOME").ok(),
            topology: std::env::var("AMPCTL_TOPOLOGY").ok(),
            journal_dir: std::env::var("AMPCTL_JOURNAL_DIR").ok(),
        }
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".ampctl").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Combine an optional config file, environment overrides and defaults.
pub fn resolve(
    config_file: Option<&Path>,
    env: &EnvOverrides,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    let parsed = match config_file {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };
    let config_dir = config_file
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));

    let home = if let Some(ref env_home) = env.home {
        PathBuf::from(env_home)
    } else if let Some(ref home) = parsed.paths.home {
        resolve_path(config_dir, home)
    } else {
        default_home
    };

    let journal_dir = if let Some(ref env_dir) = env.journal_dir {
        Some(PathBuf::from(env_dir))
    } else {
        parsed
            .paths
            .journal_dir
            .as_deref()
            .map(|dir| resolve_path(config_dir, dir))
    };

    let mut controller = parsed.controller;
    if let Some(ref topology) = env.topology {
        controller.controller_worker.loadbalancer_topology = topology
            .parse()
            .with_context(|| format!("Invalid AMPCTL_TOPOLOGY: {}", topology))?;
    }

    Ok(ResolvedConfig {
        home,
        journal_dir,
        config_file: config_file.map(Path::to_path_buf),
        controller,
    })
}

/// Load configuration from all sources
pub fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".ampctl");
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let config_file = find_config_file(&cwd);

    resolve(config_file.as_deref(), &EnvOverrides::from_env(), default_home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(temp: &TempDir, body: &str) -> PathBuf {
        let dir = temp.path().join(".ampctl");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{}", body).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_file() {
        let config = resolve(None, &EnvOverrides::default(), PathBuf::from("/tmp/home")).unwrap();

        assert_eq!(config.home, PathBuf::from("/tmp/home"));
        assert!(config.journal_dir.is_none());
        assert!(config.config_file.is_none());
        assert_eq!(config.controller, ControllerConfig::default());
        assert_eq!(
            config.controller.controller_worker.loadbalancer_topology,
            Topology::Single
        );
        assert_eq!(config.controller.haproxy_amphora.bind_port, 9443);
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            &temp,
            r#"
version: "1.0"
paths:
  journal_dir: ./flows
controller_worker:
  loadbalancer_topology: ACTIVE_STANDBY
  amp_active_retries: 5
  enable_anti_affinity: true
haproxy_amphora:
  active_connection_max_retries: 3
task_retry:
  max_attempts: 4
"#,
        );

        let config = resolve(Some(&path), &EnvOverrides::default(), PathBuf::from("/x")).unwrap();
        let worker = &config.controller.controller_worker;

        assert_eq!(worker.loadbalancer_topology, Topology::ActiveStandby);
        assert_eq!(worker.amp_active_retries, 5);
        assert!(worker.enable_anti_affinity);
        // Unset fields keep their defaults.
        assert_eq!(worker.amp_active_wait_sec, 10);
        assert_eq!(
            config.controller.haproxy_amphora.active_timeouts(),
            AgentTimeouts {
                max_retries: 3,
                retry_interval_secs: 2
            }
        );
        assert_eq!(config.controller.task_retry.max_attempts, 4);
        assert!(config.journal_dir.unwrap().ends_with("flows"));
    }

    #[test]
    fn test_env_overrides_win() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            &temp,
            "paths:\n  home: ./state\ncontroller_worker:\n  loadbalancer_topology: SINGLE\n",
        );
        let env = EnvOverrides {
            home: Some("/srv/ampctl".to_string()),
            topology: Some("ACTIVE_STANDBY".to_string()),
            journal_dir: Some("/srv/journal".to_string()),
        };

        let config = resolve(Some(&path), &env, PathBuf::from("/x")).unwrap();

        assert_eq!(config.home, PathBuf::from("/srv/ampctl"));
        assert_eq!(config.journal_dir, Some(PathBuf::from("/srv/journal")));
        assert_eq!(
            config.controller.controller_worker.loadbalancer_topology,
            Topology::ActiveStandby
        );
    }

    #[test]
    fn test_invalid_topology_is_rejected() {
        let env = EnvOverrides {
            topology: Some("TRIANGLE".to_string()),
            ..Default::default()
        };
        assert!(resolve(None, &env, PathBuf::from("/x")).is_err());

        let temp = TempDir::new().unwrap();
        let path = write_config(&temp, "controller_worker:\n  loadbalancer_topology: TRIANGLE\n");
        assert!(resolve(Some(&path), &EnvOverrides::default(), PathBuf::from("/x")).is_err());
    }

    #[test]
    fn test_find_config_in_parent() {
        let temp = TempDir::new().unwrap();
        let path = write_config(&temp, "version: \"1.0\"");
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_config_file(&nested), Some(path));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/./subdir")
        );
    }
}
