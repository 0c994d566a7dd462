//! Mock Azure utils for unit testing
//!
//! In-memory implementations of [`PublicIPAddressUtils`] and
//! [`VirtualMachineUtils`]. Both record every call and can be told to fail the
//! next N calls of an operation.

mod helpers;

pub use helpers::{public_ip_address, public_ip_address_id, virtual_machine};

use crate::error::AzureError;
use crate::models::{LoadBalancer, PublicIPAddress, VirtualMachine, VirtualMachineProperties};
use crate::pubip::{update_frontend_ip_configurations, update_load_balancing_rules, update_probes};
use crate::utils_trait::{PublicIPAddressUtils, VirtualMachineUtils};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted failures: remaining count and message per operation
#[derive(Debug)]
struct Failures<Op>(HashMap<Op, (u32, String)>);

impl<Op> Default for Failures<Op> {
    fn default() -> Self {
        Self(HashMap::new())
    }
}

impl<Op: std::hash::Hash + Eq> Failures<Op> {
    fn set(&mut self, op: Op, times: u32, message: String) {
        self.0.insert(op, (times, message));
    }

    fn take(&mut self, op: &Op) -> Option<String> {
        let entry = self.0.get_mut(op)?;
        if entry.0 == 0 {
            return None;
        }
        entry.0 -= 1;
        Some(entry.1.clone())
    }
}

/// Public IP address operation, for scripting failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublicIPAddressOperation {
    /// `get_by_name`
    GetByName,
    /// `get_by_ip`
    GetByIP,
    /// `get_all`
    GetAll,
    /// `remove_from_load_balancer`
    RemoveFromLoadBalancer,
    /// `delete`
    Delete,
}

/// A recorded call on [`MockPublicIPAddressUtils`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicIPAddressCall {
    /// `get_by_name(name)`
    GetByName(String),
    /// `get_by_ip(ip)`
    GetByIP(String),
    /// `get_all()`
    GetAll,
    /// `remove_from_load_balancer(ids)`
    RemoveFromLoadBalancer(Vec<String>),
    /// `delete(name)`
    Delete(String),
}

/// Mock [`PublicIPAddressUtils`] for testing
#[derive(Debug, Clone, Default)]
pub struct MockPublicIPAddressUtils {
    public_ips: Arc<Mutex<Vec<PublicIPAddress>>>,
    load_balancer: Arc<Mutex<LoadBalancer>>,
    failures: Arc<Mutex<Failures<PublicIPAddressOperation>>>,
    calls: Arc<Mutex<Vec<PublicIPAddressCall>>>,
}

impl MockPublicIPAddressUtils {
    /// Create an empty mock
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a public IP address to the mock cloud (for test setup)
    pub fn add_public_ip_address(&self, ip: PublicIPAddress) {
        lock(&self.public_ips).push(ip);
    }

    /// Replace the load balancer document (for test setup)
    pub fn set_load_balancer(&self, lb: LoadBalancer) {
        *lock(&self.load_balancer) = lb;
    }

    /// Current load balancer document
    pub fn load_balancer(&self) -> LoadBalancer {
        lock(&self.load_balancer).clone()
    }

    /// Public IP addresses currently in the mock cloud
    pub fn public_ip_addresses(&self) -> Vec<PublicIPAddress> {
        lock(&self.public_ips).clone()
    }

    /// Make the next `times` calls of `op` fail with `message`
    pub fn fail(&self, op: PublicIPAddressOperation, times: u32, message: impl Into<String>) {
        lock(&self.failures).set(op, times, message.into());
    }

    /// Calls made so far
    pub fn calls(&self) -> Vec<PublicIPAddressCall> {
        lock(&self.calls).clone()
    }

    fn record(&self, call: PublicIPAddressCall, op: PublicIPAddressOperation, context: &str) -> Result<(), AzureError> {
        lock(&self.calls).push(call);
        match lock(&self.failures).take(&op) {
            Some(message) => Err(AzureError::Operation(message).context(context)),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl PublicIPAddressUtils for MockPublicIPAddressUtils {
    async fn get_by_name(&self, name: &str) -> Result<Option<PublicIPAddress>, AzureError> {
        self.record(
            PublicIPAddressCall::GetByName(name.to_string()),
            PublicIPAddressOperation::GetByName,
            "could not get Azure PublicIPAddress",
        )?;
        Ok(lock(&self.public_ips)
            .iter()
            .find(|ip| ip.name.as_deref() == Some(name))
            .cloned())
    }

    async fn get_by_ip(&self, ip: &str) -> Result<Option<PublicIPAddress>, AzureError> {
        self.record(
            PublicIPAddressCall::GetByIP(ip.to_string()),
            PublicIPAddressOperation::GetByIP,
            "could not list Azure PublicIPAddresses",
        )?;
        Ok(lock(&self.public_ips)
            .iter()
            .find(|p| p.ip_address() == Some(ip))
            .cloned())
    }

    async fn get_all(&self) -> Result<Vec<PublicIPAddress>, AzureError> {
        self.record(
            PublicIPAddressCall::GetAll,
            PublicIPAddressOperation::GetAll,
            "could not list Azure PublicIPAddresses",
        )?;
        Ok(self.public_ip_addresses())
    }

    async fn remove_from_load_balancer(&self, public_ip_address_ids: &[String]) -> Result<(), AzureError> {
        self.record(
            PublicIPAddressCall::RemoveFromLoadBalancer(public_ip_address_ids.to_vec()),
            PublicIPAddressOperation::RemoveFromLoadBalancer,
            "could not update Azure LoadBalancer",
        )?;
        let mut lb = lock(&self.load_balancer);
        let fc_ids = update_frontend_ip_configurations(&mut lb, public_ip_address_ids);
        let rule_ids = update_load_balancing_rules(&mut lb, &fc_ids);
        update_probes(&mut lb, &rule_ids);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), AzureError> {
        self.record(
            PublicIPAddressCall::Delete(name.to_string()),
            PublicIPAddressOperation::Delete,
            "could not delete Azure PublicIPAddress",
        )?;
        lock(&self.public_ips).retain(|ip| ip.name.as_deref() != Some(name));
        Ok(())
    }
}

/// Virtual machine operation, for scripting failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VirtualMachineOperation {
    /// `get`
    Get,
    /// `reapply`
    Reapply,
}

/// A recorded call on [`MockVirtualMachineUtils`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VirtualMachineCall {
    /// `get(name)`
    Get(String),
    /// `reapply(name)`
    Reapply(String),
}

/// Mock [`VirtualMachineUtils`] for testing
///
/// A successful reapply moves the VM to the configured post-reapply
/// provisioning state (`Succeeded` unless changed).
#[derive(Debug, Clone)]
pub struct MockVirtualMachineUtils {
    virtual_machines: Arc<Mutex<HashMap<String, VirtualMachine>>>,
    state_after_reapply: Arc<Mutex<String>>,
    failures: Arc<Mutex<Failures<VirtualMachineOperation>>>,
    calls: Arc<Mutex<Vec<VirtualMachineCall>>>,
}

impl Default for MockVirtualMachineUtils {
    fn default() -> Self {
        Self {
            virtual_machines: Arc::default(),
            state_after_reapply: Arc::new(Mutex::new(crate::models::PROVISIONING_STATE_SUCCEEDED.to_string())),
            failures: Arc::default(),
            calls: Arc::default(),
        }
    }
}

impl MockVirtualMachineUtils {
    /// Create an empty mock
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a virtual machine to the mock cloud (for test setup)
    pub fn add_virtual_machine(&self, vm: VirtualMachine) {
        let name = vm.name.clone().unwrap_or_default();
        lock(&self.virtual_machines).insert(name, vm);
    }

    /// Remove a virtual machine from the mock cloud
    pub fn remove_virtual_machine(&self, name: &str) {
        lock(&self.virtual_machines).remove(name);
    }

    /// Provisioning state a VM has after a successful reapply
    pub fn set_state_after_reapply(&self, state: impl Into<String>) {
        *lock(&self.state_after_reapply) = state.into();
    }

    /// Make the next `times` calls of `op` fail with `message`
    pub fn fail(&self, op: VirtualMachineOperation, times: u32, message: impl Into<String>) {
        lock(&self.failures).set(op, times, message.into());
    }

    /// Calls made so far
    pub fn calls(&self) -> Vec<VirtualMachineCall> {
        lock(&self.calls).clone()
    }

    fn record(&self, call: VirtualMachineCall, op: VirtualMachineOperation, context: &str) -> Result<(), AzureError> {
        lock(&self.calls).push(call);
        match lock(&self.failures).take(&op) {
            Some(message) => Err(AzureError::Operation(message).context(context)),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl VirtualMachineUtils for MockVirtualMachineUtils {
    async fn get(&self, name: &str) -> Result<Option<VirtualMachine>, AzureError> {
        self.record(
            VirtualMachineCall::Get(name.to_string()),
            VirtualMachineOperation::Get,
            "could not get Azure VirtualMachine",
        )?;
        Ok(lock(&self.virtual_machines).get(name).cloned())
    }

    async fn reapply(&self, name: &str) -> Result<(), AzureError> {
        self.record(
            VirtualMachineCall::Reapply(name.to_string()),
            VirtualMachineOperation::Reapply,
            "could not reapply Azure VirtualMachine",
        )?;
        let state = lock(&self.state_after_reapply).clone();
        let mut vms = lock(&self.virtual_machines);
        let Some(vm) = vms.get_mut(name) else {
            return Err(AzureError::NotFound(name.to_string()).context("could not reapply Azure VirtualMachine"));
        };
        vm.properties
            .get_or_insert_with(VirtualMachineProperties::default)
            .provisioning_state = Some(state);
        Ok(())
    }
}
