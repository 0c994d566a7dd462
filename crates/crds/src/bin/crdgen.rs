//! Prints the remedy CRDs as a multi-document YAML stream.

use crds::{PublicIPAddress, VirtualMachine};
use kube::CustomResourceExt;

fn main() {
    for crd in [PublicIPAddress::crd(), VirtualMachine::crd()] {
        match serde_yaml::to_string(&crd) {
            Ok(yaml) => print!("---\n{yaml}"),
            Err(e) => {
                eprintln!("Failed to serialize CRD: {e}");
                std::process::exit(1);
            }
        }
    }
}
