//! VirtualMachine remediator.
//!
//! Mirrors the Azure virtual machine of each record into the record status
//! and reapplies it when it is in the Failed provisioning state while its node
//! is not ready or unreachable.

use super::{failure_outcome, update_status};
use crate::client::ResourceClient;
use crate::clock::Clock;
use crate::config::FailedVMRemedyConfiguration;
use crate::error::ActuatorError;
use crate::metrics::{Metrics, VmState};
use crate::reconciler::{Actuator, Outcome};
use async_trait::async_trait;
use azure_client::{AzureError, PROVISIONING_STATE_FAILED, VirtualMachineUtils, is_terminal_provisioning_state};
use crds::{
    FailedOperation, OperationType, VirtualMachine, VirtualMachineStatus, add_or_update_failed_operation,
    delete_failed_operation,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

type AzureVirtualMachine = azure_client::VirtualMachine;

/// Name of the Azure virtual machine of a record: the name found by the last
/// lookup, else the last segment of the provider ID, else the record name.
pub fn azure_virtual_machine_name(vm: &VirtualMachine) -> String {
    if let Some(name) = vm.status.as_ref().and_then(|s| s.name.as_deref()).filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    match vm.spec.provider_id.rfind('/') {
        Some(i) if i > 0 => vm.spec.provider_id[i + 1..].to_string(),
        _ => vm.metadata.name.clone().unwrap_or_default(),
    }
}

fn virtual_machine_status(
    azure_vm: Option<&AzureVirtualMachine>,
    failed_operations: Vec<FailedOperation>,
) -> VirtualMachineStatus {
    match azure_vm {
        Some(azure_vm) => VirtualMachineStatus {
            exists: true,
            id: azure_vm.id.clone(),
            name: azure_vm.name.clone(),
            provisioning_state: azure_vm.provisioning_state().map(str::to_string),
            failed_operations,
        },
        None => VirtualMachineStatus {
            failed_operations,
            ..Default::default()
        },
    }
}

fn is_failed(azure_vm: &AzureVirtualMachine) -> bool {
    azure_vm.provisioning_state() == Some(PROVISIONING_STATE_FAILED)
}

/// Remediates VirtualMachine records.
pub struct VirtualMachineActuator {
    client: Arc<dyn ResourceClient<VirtualMachine>>,
    utils: Arc<dyn VirtualMachineUtils>,
    config: FailedVMRemedyConfiguration,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for VirtualMachineActuator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMachineActuator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl VirtualMachineActuator {
    /// Create a VirtualMachine remediator
    pub fn new(
        client: Arc<dyn ResourceClient<VirtualMachine>>,
        utils: Arc<dyn VirtualMachineUtils>,
        config: FailedVMRemedyConfiguration,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        info!(?config, "Creating virtualmachine actuator");
        Self {
            client,
            utils,
            config,
            clock,
            metrics,
        }
    }

    /// Record a failed operation, persist it with the previous cloud snapshot
    /// and return the outcome of the retry ladder.
    async fn handle_failure(
        &self,
        vm: &VirtualMachine,
        mut status: VirtualMachineStatus,
        operation_type: OperationType,
        error: &AzureError,
        max_attempts: u32,
        exhausted: Outcome,
    ) -> Result<(Outcome, bool), ActuatorError> {
        let failed_operation = add_or_update_failed_operation(
            &mut status.failed_operations,
            operation_type,
            error.to_string(),
            self.clock.now(),
        );
        warn!(
            name = vm.metadata.name.as_deref().unwrap_or_default(),
            operation = %operation_type,
            attempts = failed_operation.attempts,
            "Azure virtual machine operation failed: {}",
            error
        );
        update_status(self.client.as_ref(), vm, &status).await?;
        let given_up = failed_operation.attempts >= max_attempts;
        Ok((
            failure_outcome(&failed_operation, max_attempts, self.config.requeue_interval, exhausted),
            given_up,
        ))
    }

    async fn reapply(&self, name: &str) -> Result<Option<AzureVirtualMachine>, AzureError> {
        info!(name, "Reapplying Azure virtual machine");
        self.utils.reapply(name).await?;
        self.utils.get(name).await
    }

    fn set_vm_state(&self, name: &str, azure_vm: Option<&AzureVirtualMachine>) {
        match azure_vm {
            Some(azure_vm) if is_failed(azure_vm) => self.metrics.set_vm_state(name, VmState::Failed),
            Some(_) => self.metrics.set_vm_state(name, VmState::Ok),
            None => self.metrics.remove_vm_state(name),
        }
    }

    fn requeue_after(&self, azure_vm: Option<&AzureVirtualMachine>) -> Duration {
        // Poll quickly while the VM is missing or still provisioning
        match azure_vm {
            Some(azure_vm) if is_terminal_provisioning_state(azure_vm.provisioning_state()) => {
                self.config.sync_period
            }
            _ => self.config.requeue_interval,
        }
    }
}

#[async_trait]
impl Actuator<VirtualMachine> for VirtualMachineActuator {
    async fn create_or_update(&self, vm: &VirtualMachine) -> Result<Outcome, ActuatorError> {
        let name = azure_virtual_machine_name(vm);
        let previous = vm.status.clone().unwrap_or_default();

        let azure_vm = match self.utils.get(&name).await {
            Ok(azure_vm) => azure_vm,
            Err(e) => {
                let (outcome, _) = self
                    .handle_failure(
                        vm,
                        previous,
                        OperationType::GetVirtualMachine,
                        &e,
                        self.config.max_get_attempts,
                        Outcome::Done(self.config.sync_period),
                    )
                    .await?;
                return Ok(outcome);
            }
        };

        let mut failed_operations = previous.failed_operations;
        delete_failed_operation(&mut failed_operations, OperationType::GetVirtualMachine);
        let status = virtual_machine_status(azure_vm.as_ref(), failed_operations);
        debug!(name, ?status, "Updating virtualmachine status");
        update_status(self.client.as_ref(), vm, &status).await?;

        match azure_vm.as_ref() {
            Some(failed_vm) if is_failed(failed_vm) && vm.spec.not_ready_or_unreachable => {
                self.metrics.set_vm_state(&name, VmState::FailedWillReapply);
                let reapplied_vm = match self.reapply(&name).await {
                    Ok(reapplied_vm) => reapplied_vm,
                    Err(e) => {
                        let (outcome, given_up) = self
                            .handle_failure(
                                vm,
                                status,
                                OperationType::ReapplyVirtualMachine,
                                &e,
                                self.config.max_reapply_attempts,
                                Outcome::Done(self.config.sync_period),
                            )
                            .await?;
                        if given_up {
                            self.metrics.set_vm_state(&name, VmState::Failed);
                        }
                        return Ok(outcome);
                    }
                };

                info!(name, "Reapplied Azure virtual machine");
                self.metrics.reapplied_virtual_machines.inc();
                self.set_vm_state(&name, reapplied_vm.as_ref());

                let mut failed_operations = status.failed_operations;
                delete_failed_operation(&mut failed_operations, OperationType::ReapplyVirtualMachine);
                let status = virtual_machine_status(reapplied_vm.as_ref(), failed_operations);
                update_status(self.client.as_ref(), vm, &status).await?;
            }
            Some(failed_vm) if is_failed(failed_vm) => {
                debug!(name, "Azure virtual machine is Failed but its node is ready, not reapplying");
                self.metrics.set_vm_state(&name, VmState::Failed);
            }
            other => self.set_vm_state(&name, other),
        }

        Ok(Outcome::Done(self.requeue_after(azure_vm.as_ref())))
    }

    async fn delete(&self, vm: &VirtualMachine) -> Result<Outcome, ActuatorError> {
        let name = azure_virtual_machine_name(vm);
        let previous = vm.status.clone().unwrap_or_default();

        let azure_vm = match self.utils.get(&name).await {
            Ok(azure_vm) => azure_vm,
            Err(e) => {
                let (outcome, _) = self
                    .handle_failure(
                        vm,
                        previous,
                        OperationType::GetVirtualMachine,
                        &e,
                        self.config.max_get_attempts,
                        Outcome::done(),
                    )
                    .await?;
                return Ok(outcome);
            }
        };

        let mut failed_operations = previous.failed_operations;
        delete_failed_operation(&mut failed_operations, OperationType::GetVirtualMachine);
        self.set_vm_state(&name, azure_vm.as_ref());
        let status = virtual_machine_status(azure_vm.as_ref(), failed_operations);
        update_status(self.client.as_ref(), vm, &status).await?;
        Ok(Outcome::done())
    }

    async fn should_finalize(&self, _vm: &VirtualMachine) -> Result<bool, ActuatorError> {
        Ok(true)
    }
}
