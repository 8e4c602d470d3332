//! Renders the INI configuration consumed by the amphora agent.

use std::fmt::Write as _;

use crate::config::ControllerConfig;
use crate::domain::Topology;

/// Render the agent configuration for one amphora.
pub fn render_agent_config(amphora_id: &str, topology: Topology, config: &ControllerConfig) -> String {
    let haproxy = &config.haproxy_amphora;
    let health = &config.health_manager;
    let agent = &config.amphora_agent;

    let mut out = String::new();
    section(&mut out, "DEFAULT");
    entry(&mut out, "debug", "False");

    section(&mut out, "haproxy_amphora");
    entry(&mut out, "base_cert_dir", &haproxy.base_cert_dir);
    entry(&mut out, "base_path", &haproxy.base_path);
    entry(&mut out, "bind_host", &haproxy.bind_host);
    entry(&mut out, "bind_port", haproxy.bind_port);
    entry(&mut out, "haproxy_cmd", &haproxy.haproxy_cmd);
    entry(&mut out, "respawn_count", haproxy.respawn_count);
    entry(&mut out, "respawn_interval", haproxy.respawn_interval);
    entry(&mut out, "use_upstart", python_bool(haproxy.use_upstart));

    section(&mut out, "health_manager");
    entry(&mut out, "controller_ip_port_list", health.controller_ip_port_list.join(", "));
    entry(&mut out, "heartbeat_interval", health.heartbeat_interval);
    entry(&mut out, "heartbeat_key", health.heartbeat_key.as_deref().unwrap_or(""));

    section(&mut out, "amphora_agent");
    entry(&mut out, "agent_server_ca", &agent.agent_server_ca);
    entry(&mut out, "agent_server_cert", &agent.agent_server_cert);
    entry(&mut out, "agent_server_network_dir", &agent.agent_server_network_dir);
    entry(&mut out, "agent_request_read_timeout", agent.agent_request_read_timeout);
    entry(&mut out, "amphora_id", amphora_id);
    entry(&mut out, "amphora_udp_driver", &agent.amphora_udp_driver);
    entry(&mut out, "agent_tls_protocol", &agent.agent_tls_protocol);
    entry(&mut out, "administrative_log_facility", agent.administrative_log_facility);
    entry(&mut out, "user_log_facility", agent.user_log_facility);

    section(&mut out, "controller_worker");
    entry(&mut out, "loadbalancer_topology", topology.as_str());

    out
}

fn section(out: &mut String, name: &str) {
    if !out.is_empty() {
        out.push('\n');
    }
    let _ = writeln!(out, "[{}]", name);
}

fn entry(out: &mut String, key: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "{} = {}", key, value);
}

fn python_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}
