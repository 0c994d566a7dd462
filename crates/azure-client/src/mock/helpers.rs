//! Builders for mock Azure resources

use crate::models::{PublicIPAddress, PublicIPAddressProperties, VirtualMachine, VirtualMachineProperties};

/// Resource ID of a public IP address in the mock resource group
pub fn public_ip_address_id(name: &str) -> String {
    format!("/subscriptions/00000000-0000-0000-0000-000000000000/resourceGroups/shoot--dev--test/providers/Microsoft.Network/publicIPAddresses/{name}")
}

/// Public IP address with the given name, address and provisioning state
pub fn public_ip_address(name: &str, ip: Option<&str>, provisioning_state: &str) -> PublicIPAddress {
    PublicIPAddress {
        id: Some(public_ip_address_id(name)),
        name: Some(name.to_string()),
        properties: Some(PublicIPAddressProperties {
            ip_address: ip.map(str::to_string),
            provisioning_state: Some(provisioning_state.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Virtual machine with the given name and provisioning state
pub fn virtual_machine(name: &str, provisioning_state: &str) -> VirtualMachine {
    VirtualMachine {
        id: Some(format!(
            "/subscriptions/00000000-0000-0000-0000-000000000000/resourceGroups/shoot--dev--test/providers/Microsoft.Compute/virtualMachines/{name}"
        )),
        name: Some(name.to_string()),
        properties: Some(VirtualMachineProperties {
            provisioning_state: Some(provisioning_state.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
