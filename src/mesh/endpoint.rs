/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/mesh/endpoint.rs
 *
 * Gateway endpoint discovery with NodePort fallback. Polls the east-west
 * gateway Service every 5s for up to 5 minutes, selecting the TLS port (by
 * name "tls" or number 15443) and preferring, in order: LoadBalancer
 * ingress, Service `externalIPs`, ClusterIP, then (only after a 2-minute
 * fallback window) a NodePort paired with the first configured fallback
 * host.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use crate::client::ClusterClient;
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{Service, ServicePort};
use std::time::Duration;

pub const GATEWAY_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(300);
pub const NODEPORT_FALLBACK_WINDOW: Duration = Duration::from_secs(120);
const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayEndpoint {
    pub host: String,
    pub port: i32,
    pub source: &'static str,
}

fn is_tls_port(port: &ServicePort) -> bool {
    port.name.as_deref() == Some("tls") || port.port == 15443
}

/// Attempts to select an endpoint from a single `Service` snapshot. Returns
/// `None` when no usable address/port combination exists yet (the caller
/// keeps polling); the NodePort branch additionally requires `elapsed` to
/// have crossed `NODEPORT_FALLBACK_WINDOW` and at least one configured
/// fallback host.
fn select_endpoint(service: &Service, fallback_hosts: &[String], elapsed: Duration) -> Option<GatewayEndpoint> {
    let spec = service.spec.as_ref()?;
    let tls_port = spec.ports.as_ref()?.iter().find(|p| is_tls_port(p))?;

    if let Some(ingress) = service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|list| list.first())
    {
        if let Some(ip) = &ingress.ip {
            return Some(GatewayEndpoint {
                host: ip.clone(),
                port: tls_port.port,
                source: "loadBalancer",
            });
        }
        if let Some(hostname) = &ingress.hostname {
            return Some(GatewayEndpoint {
                host: hostname.clone(),
                port: tls_port.port,
                source: "loadBalancer",
            });
        }
    }

    if let Some(external_ip) = spec.external_i_ps.as_ref().and_then(|ips| ips.first()) {
        return Some(GatewayEndpoint {
            host: external_ip.clone(),
            port: tls_port.port,
            source: "externalIP",
        });
    }

    if spec.type_.as_deref() == Some("ClusterIP") {
        if let Some(cluster_ip) = &spec.cluster_ip {
            if cluster_ip != "None" {
                return Some(GatewayEndpoint {
                    host: cluster_ip.clone(),
                    port: tls_port.port,
                    source: "clusterIP",
                });
            }
        }
    }

    if spec.type_.as_deref() == Some("NodePort") && elapsed >= NODEPORT_FALLBACK_WINDOW {
        if let (Some(node_port), Some(host)) = (tls_port.node_port, fallback_hosts.first()) {
            return Some(GatewayEndpoint {
                host: host.clone(),
                port: node_port,
                source: "nodePort",
            });
        }
    }

    None
}

/// Polls `namespace/service_name` until `select_endpoint` returns `Some`, a
/// missing Service is treated as "keep polling" rather than an error, and
/// the overall budget is `GATEWAY_DISCOVERY_TIMEOUT`.
pub async fn discover(
    client: &ClusterClient,
    namespace: &str,
    service_name: &str,
    fallback_hosts: &[String],
) -> Result<GatewayEndpoint> {
    let start = tokio::time::Instant::now();
    loop {
        let elapsed = start.elapsed();
        if let Some(service) = client.get_service(namespace, service_name).await? {
            if let Some(endpoint) = select_endpoint(&service, fallback_hosts, elapsed) {
                return Ok(endpoint);
            }
        }
        if elapsed >= GATEWAY_DISCOVERY_TIMEOUT {
            return Err(Error::Timeout(format!(
                "gateway endpoint for {}/{} not discovered after {:?}",
                namespace, service_name, GATEWAY_DISCOVERY_TIMEOUT
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, ServiceSpec, ServiceStatus,
    };

    fn service_with_ports(ports: Vec<ServicePort>) -> Service {
        Service {
            spec: Some(ServiceSpec {
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn load_balancer_ip_wins_over_everything_else() {
        let mut service = service_with_ports(vec![ServicePort {
            name: Some("tls".to_string()),
            port: 15443,
            ..Default::default()
        }]);
        service.spec.as_mut().unwrap().type_ = Some("LoadBalancer".to_string());
        service.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    ip: Some("1.2.3.4".to_string()),
                    ..Default::default()
                }]),
            }),
            ..Default::default()
        });

        let endpoint = select_endpoint(&service, &[], Duration::from_secs(0)).unwrap();
        assert_eq!(
            endpoint,
            GatewayEndpoint {
                host: "1.2.3.4".to_string(),
                port: 15443,
                source: "loadBalancer",
            }
        );
    }

    #[test]
    fn nodeport_requires_fallback_window_elapsed() {
        let mut service = service_with_ports(vec![ServicePort {
            name: Some("tls".to_string()),
            port: 15443,
            node_port: Some(31443),
            ..Default::default()
        }]);
        service.spec.as_mut().unwrap().type_ = Some("NodePort".to_string());

        let fallback_hosts = vec!["10.0.0.1".to_string()];
        assert!(select_endpoint(&service, &fallback_hosts, Duration::from_secs(10)).is_none());

        let endpoint = select_endpoint(&service, &fallback_hosts, NODEPORT_FALLBACK_WINDOW).unwrap();
        assert_eq!(
            endpoint,
            GatewayEndpoint {
                host: "10.0.0.1".to_string(),
                port: 31443,
                source: "nodePort",
            }
        );
    }
}
