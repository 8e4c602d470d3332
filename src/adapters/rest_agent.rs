//! HTTP client for the amphora agent API.
//!
//! Each amphora runs an agent at `{scheme}://{lb_network_ip}:{bind_port}/1.0/`.
//! Connection failures are retried on a fixed interval up to the caller's
//! budget and then reported as a timeout.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, Response, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{AdapterError, AgentClient};
use crate::config::HaproxyAmphoraSettings;
use crate::domain::{
    AgentTimeouts, Amphora, AmphoraNetworkConfig, Listener, LoadBalancer, NetworkConfigs, Port,
};

const API_VERSION: &str = "1.0";

enum Payload<'a> {
    Empty,
    Json(Value),
    Text(&'a str),
}

pub struct RestAgentClient {
    client: reqwest::Client,
    scheme: String,
    port: u16,
    /// Used by calls that carry no budget of their own
    default_timeouts: AgentTimeouts,
}

impl RestAgentClient {
    pub fn new(settings: &HaproxyAmphoraSettings) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(settings.rest_request_conn_timeout))
            .timeout(Duration::from_secs(settings.rest_request_read_timeout))
            .build()
            .map_err(|e| AdapterError::Rejected(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            scheme: settings.agent_scheme.clone(),
            port: settings.bind_port,
            default_timeouts: settings.connection_timeouts(),
        })
    }

    fn url(&self, amphora: &Amphora, path: &str) -> Result<String, AdapterError> {
        let ip = amphora.lb_network_ip.as_deref().ok_or_else(|| {
            AdapterError::InvalidTarget(format!("amphora {} has no management address", amphora.id))
        })?;
        Ok(format!(
            "{}://{}:{}/{}/{}",
            self.scheme, ip, self.port, API_VERSION, path
        ))
    }

    async fn request(
        &self,
        method: Method,
        amphora: &Amphora,
        path: &str,
        payload: Payload<'_>,
        timeouts: &AgentTimeouts,
    ) -> Result<Response, AdapterError> {
        let url = self.url(amphora, path)?;
        let attempts = timeouts.max_retries.max(1);

        for attempt in 1..=attempts {
            let builder = self.client.request(method.clone(), &url);
            let builder = match &payload {
                Payload::Empty => builder,
                Payload::Json(body) => builder.json(body),
                Payload::Text(body) => builder.body(body.to_string()),
            };

            match builder.send().await {
                Ok(response) => {
                    debug!(amphora_id = %amphora.id, %method, path, status = %response.status(), "agent call");
                    return Ok(response);
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    warn!(
                        amphora_id = %amphora.id,
                        path,
                        attempt,
                        error = %e,
                        "Could not connect to amphora agent, retrying"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(timeouts.retry_interval()).await;
                    }
                }
                Err(e) => return Err(AdapterError::Connection(e.to_string())),
            }
        }

        Err(AdapterError::Timeout(format!(
            "amphora {} agent unreachable after {} attempts",
            amphora.id, attempts
        )))
    }

    async fn call(
        &self,
        method: Method,
        amphora: &Amphora,
        path: &str,
        payload: Payload<'_>,
        timeouts: &AgentTimeouts,
    ) -> Result<Response, AdapterError> {
        let response = self.request(method, amphora, path, payload, timeouts).await?;
        check_status(response, path).await
    }
}

async fn check_status(response: Response, path: &str) -> Result<Response, AdapterError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => AdapterError::not_found("agent resource", path),
        StatusCode::SERVICE_UNAVAILABLE => {
            AdapterError::Connection(format!("{} returned {}: {}", path, status, body))
        }
        _ => AdapterError::Rejected(format!("{} returned {}: {}", path, status, body)),
    })
}

fn first_ip(port: Option<&Port>) -> Option<&str> {
    port.and_then(|p| p.fixed_ips.first())
        .map(|ip| ip.ip_address.as_str())
}

#[async_trait]
impl AgentClient for RestAgentClient {
    async fn get_info(
        &self,
        amphora: &Amphora,
        timeouts: &AgentTimeouts,
    ) -> Result<Value, AdapterError> {
        let response = self
            .call(Method::GET, amphora, "info", Payload::Empty, timeouts)
            .await?;
        response
            .json()
            .await
            .map_err(|e| AdapterError::Rejected(format!("invalid info response: {}", e)))
    }

    async fn update_listeners(
        &self,
        lb: &LoadBalancer,
        listeners: &[Listener],
        amphora: &Amphora,
        timeouts: &AgentTimeouts,
    ) -> Result<(), AdapterError> {
        let body = json!({
            "loadbalancer_id": lb.id,
            "listeners": listeners
                .iter()
                .map(|l| json!({"id": l.id, "protocol": l.protocol, "protocol_port": l.protocol_port}))
                .collect::<Vec<_>>(),
        });
        let path = format!("loadbalancer/{}/{}/haproxy", amphora.id, lb.id);
        self.call(Method::PUT, amphora, &path, Payload::Json(body), timeouts)
            .await
            .map(|_| ())
    }

    async fn reload(
        &self,
        lb: &LoadBalancer,
        amphora: &Amphora,
        timeouts: &AgentTimeouts,
    ) -> Result<(), AdapterError> {
        let path = format!("loadbalancer/{}/reload", lb.id);
        self.call(Method::PUT, amphora, &path, Payload::Empty, timeouts)
            .await
            .map(|_| ())
    }

    async fn start(
        &self,
        lb: &LoadBalancer,
        amphora: &Amphora,
        timeouts: &AgentTimeouts,
    ) -> Result<(), AdapterError> {
        let path = format!("loadbalancer/{}/start", lb.id);
        self.call(Method::PUT, amphora, &path, Payload::Empty, timeouts)
            .await
            .map(|_| ())
    }

    async fn delete_listener(
        &self,
        amphora: &Amphora,
        listener: &Listener,
    ) -> Result<(), AdapterError> {
        let path = format!("listeners/{}", listener.id);
        match self
            .call(Method::DELETE, amphora, &path, Payload::Empty, &self.default_timeouts)
            .await
        {
            Ok(_) | Err(AdapterError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn upload_cert(&self, amphora: &Amphora, pem: &str) -> Result<(), AdapterError> {
        self.call(
            Method::PUT,
            amphora,
            "certificate",
            Payload::Text(pem),
            &self.default_timeouts,
        )
        .await
        .map(|_| ())
    }

    async fn update_agent_config(
        &self,
        amphora: &Amphora,
        rendered: &str,
    ) -> Result<(), AdapterError> {
        match self
            .call(
                Method::PUT,
                amphora,
                "config",
                Payload::Text(rendered),
                &self.default_timeouts,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(AdapterError::NotFound { .. }) => Err(AdapterError::NotSupported(format!(
                "amphora {} agent does not support configuration updates",
                amphora.id
            ))),
            Err(e) => Err(e),
        }
    }

    async fn get_vrrp_interface(
        &self,
        amphora: &Amphora,
        timeouts: &AgentTimeouts,
    ) -> Result<String, AdapterError> {
        let vrrp_ip = amphora.vrrp_ip.as_deref().ok_or_else(|| {
            AdapterError::InvalidTarget(format!("amphora {} has no VRRP address", amphora.id))
        })?;
        let response = self
            .call(
                Method::GET,
                amphora,
                &format!("interface/{}", vrrp_ip),
                Payload::Empty,
                timeouts,
            )
            .await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| AdapterError::Rejected(format!("invalid interface response: {}", e)))?;
        body.get("interface")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AdapterError::Rejected("interface response without a name".to_string()))
    }

    async fn update_vrrp_conf(
        &self,
        lb: &LoadBalancer,
        network_configs: &NetworkConfigs,
        amphora: &Amphora,
        timeouts: &AgentTimeouts,
    ) -> Result<(), AdapterError> {
        let peers: Vec<&str> = network_configs
            .values()
            .filter(|config| config.amphora_id != amphora.id)
            .filter_map(|config| first_ip(config.vrrp_port.as_ref()))
            .collect();
        let body = json!({
            "loadbalancer_id": lb.id,
            "vrrp_group": lb.vrrp_group,
            "vrrp_ip": amphora.vrrp_ip,
            "vrrp_interface": amphora.vrrp_interface,
            "priority": amphora.vrrp_priority,
            "vip": amphora.ha_ip,
            "peers": peers,
        });
        self.call(Method::PUT, amphora, "vrrp/upload", Payload::Json(body), timeouts)
            .await
            .map(|_| ())
    }

    async fn start_vrrp_service(
        &self,
        amphora: &Amphora,
        timeouts: &AgentTimeouts,
    ) -> Result<(), AdapterError> {
        self.call(Method::PUT, amphora, "vrrp/start", Payload::Empty, timeouts)
            .await
            .map(|_| ())
    }

    async fn finalize(&self, amphora: &Amphora) -> Result<(), AdapterError> {
        debug!(amphora_id = %amphora.id, "Agent needs no finalization step");
        Ok(())
    }

    async fn post_network_plug(&self, amphora: &Amphora, port: &Port) -> Result<(), AdapterError> {
        let body = json!({
            "network_id": port.network_id,
            "mac_address": port.mac_address,
            "fixed_ips": port.fixed_ips,
        });
        self.call(
            Method::POST,
            amphora,
            "plug/network",
            Payload::Json(body),
            &self.default_timeouts,
        )
        .await
        .map(|_| ())
    }

    async fn post_vip_plug(
        &self,
        amphora: &Amphora,
        lb: &LoadBalancer,
        network_config: &AmphoraNetworkConfig,
    ) -> Result<(), AdapterError> {
        let vip_ip = lb
            .vip
            .as_ref()
            .and_then(|v| v.ip_address.as_deref())
            .ok_or_else(|| AdapterError::InvalidTarget(format!("load balancer {} has no VIP", lb.id)))?;
        let subnet = network_config.vip_subnet.as_ref();
        let body = json!({
            "subnet_cidr": subnet.map(|s| s.cidr.as_str()),
            "gateway": subnet.and_then(|s| s.gateway_ip.as_deref()),
            "mac_address": network_config.vrrp_port.as_ref().and_then(|p| p.mac_address.as_deref()),
            "vrrp_ip": amphora.vrrp_ip,
        });
        self.call(
            Method::POST,
            amphora,
            &format!("plug/vip/{}", vip_ip),
            Payload::Json(body),
            &self.default_timeouts,
        )
        .await
        .map(|_| ())
    }
}
