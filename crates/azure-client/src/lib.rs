//! Azure Resource Manager Client
//!
//! A small client for the parts of the Azure Resource Manager REST API the
//! remedy controller needs: public IP addresses, the cluster load balancer and
//! virtual machines.
//!
//! # Example
//!
//! ```no_run
//! use azure_client::{AzureClient, AzurePublicIPAddressUtils, PublicIPAddressUtils, read_credentials};
//! use prometheus::IntCounter;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let credentials = read_credentials("/etc/kubernetes/cloudprovider/cloudprovider.conf")?;
//! let client = AzureClient::new(
//!     credentials,
//!     IntCounter::new("reads", "reads")?,
//!     IntCounter::new("writes", "writes")?,
//! )?;
//! let utils = AzurePublicIPAddressUtils::new(Arc::new(client));
//!
//! if let Some(ip) = utils.get_by_ip("1.2.3.4").await? {
//!     println!("{:?}", ip.name);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Not-found normalization**: absent resources are `Ok(None)`, never errors
//! - **Pagination**: listings follow `nextLink` until exhausted
//! - **Long-running operations**: writes wait for the operation to complete
//! - **Request counters**: every outbound read/write request is counted

pub mod client;
pub mod credentials;
pub mod error;
pub mod models;
pub mod pubip;
#[path = "trait.rs"]
pub mod utils_trait;
pub mod vm;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::AzureClient;
pub use credentials::{Credentials, read_credentials};
pub use error::AzureError;
pub use models::*;
pub use pubip::AzurePublicIPAddressUtils;
pub use utils_trait::{PublicIPAddressUtils, VirtualMachineUtils};
pub use vm::AzureVirtualMachineUtils;
#[cfg(feature = "test-util")]
pub use mock::{MockPublicIPAddressUtils, MockVirtualMachineUtils};
