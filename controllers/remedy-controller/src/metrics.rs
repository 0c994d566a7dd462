//! Prometheus metrics and the HTTP server exposing them.
//!
//! Provides:
//! - `/metrics` - Prometheus text exposition of the controller registry
//! - `/healthz` - Liveness probe (always returns 200 if the server is running)

use crate::error::ControllerError;
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, GaugeVec, IntCounter, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Observed state of an Azure virtual machine, exported through `vm_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Not in the Failed provisioning state
    Ok,
    /// Failed, a reapply is about to be attempted
    FailedWillReapply,
    /// Failed and no reapply is due
    Failed,
}

impl VmState {
    fn value(self) -> f64 {
        match self {
            VmState::Ok => 0.0,
            VmState::FailedWillReapply => 1.0,
            VmState::Failed => 2.0,
        }
    }
}

/// Metrics of the remedy controller, all registered in one registry.
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    /// Successful public IP address cleanups
    pub cleaned_public_ips: IntCounter,
    /// Successful virtual machine reapplies
    pub reapplied_virtual_machines: IntCounter,
    /// Outbound Azure read requests
    pub azure_read_requests: IntCounter,
    /// Outbound Azure write requests
    pub azure_write_requests: IntCounter,
    vm_states: GaugeVec,
}

impl Metrics {
    /// Create the metrics and register them in a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let cleaned_public_ips = IntCounter::new(
            "cleaned_azure_public_ips_total",
            "Number of cleaned Azure public IP addresses",
        )?;
        let reapplied_virtual_machines = IntCounter::new(
            "reapplied_azure_virtual_machines",
            "Number of reapplied Azure virtual machines",
        )?;
        let azure_read_requests = IntCounter::new(
            "azure_read_requests_total",
            "Number of read requests sent to Azure",
        )?;
        let azure_write_requests = IntCounter::new(
            "azure_write_requests_total",
            "Number of write requests sent to Azure",
        )?;
        let vm_states = GaugeVec::new(
            Opts::new("vm_state", "States of Azure virtual machines (0 OK, 1 Failed will reapply, 2 Failed)"),
            &["name"],
        )?;

        registry.register(Box::new(cleaned_public_ips.clone()))?;
        registry.register(Box::new(reapplied_virtual_machines.clone()))?;
        registry.register(Box::new(azure_read_requests.clone()))?;
        registry.register(Box::new(azure_write_requests.clone()))?;
        registry.register(Box::new(vm_states.clone()))?;

        Ok(Self {
            registry,
            cleaned_public_ips,
            reapplied_virtual_machines,
            azure_read_requests,
            azure_write_requests,
            vm_states,
        })
    }

    /// Set the state of the named virtual machine
    pub fn set_vm_state(&self, name: &str, state: VmState) {
        self.vm_states.with_label_values(&[name]).set(state.value());
    }

    /// Forget the named virtual machine
    pub fn remove_vm_state(&self, name: &str) {
        // Removing a label that was never set is not an error worth reporting
        if let Err(e) = self.vm_states.remove_label_values(&[name]) {
            debug!(name, "Could not remove vm_state label: {}", e);
        }
    }

    /// Encode all metrics in the Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Liveness probe handler
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Metrics handler
async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> Response {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "could not encode metrics").into_response()
        }
    }
}

/// Create the metrics server router
pub fn create_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Serve metrics and the liveness probe on `addr` until the task is aborted
pub async fn run_metrics_server(metrics: Arc<Metrics>, addr: SocketAddr) -> Result<(), ControllerError> {
    info!(%addr, "Starting metrics server");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::Metrics(format!("could not bind {addr}: {e}")))?;
    axum::serve(listener, create_router(metrics))
        .await
        .map_err(|e| ControllerError::Metrics(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_registered() {
        let metrics = Metrics::new().unwrap();
        metrics.cleaned_public_ips.inc();
        metrics.set_vm_state("vm1", VmState::Ok);

        let encoded = metrics.encode().unwrap();
        assert!(encoded.contains("cleaned_azure_public_ips_total 1"));
        assert!(encoded.contains("reapplied_azure_virtual_machines 0"));
        assert!(encoded.contains("azure_read_requests_total"));
        assert!(encoded.contains("azure_write_requests_total"));
        assert!(encoded.contains("vm_state{name=\"vm1\"} 0"));
    }

    #[test]
    fn test_vm_state_values() {
        let metrics = Metrics::new().unwrap();
        metrics.set_vm_state("vm1", VmState::FailedWillReapply);
        assert!(metrics.encode().unwrap().contains("vm_state{name=\"vm1\"} 1"));

        metrics.set_vm_state("vm1", VmState::Failed);
        assert!(metrics.encode().unwrap().contains("vm_state{name=\"vm1\"} 2"));

        metrics.remove_vm_state("vm1");
        assert!(!metrics.encode().unwrap().contains("name=\"vm1\""));

        // Removing an unknown label is harmless
        metrics.remove_vm_state("vm2");
    }

    #[tokio::test]
    async fn test_router_serves_metrics() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let response = metrics_handler(State(metrics)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
