//! Reflink-based libvirt virtual machine duplication.
//!
//! The engine clones a domain's disk images with filesystem-native
//! copy-on-write, then stages each qcow2 clone as a block device and rewrites
//! everything that identifies the guest: domain name, UUID, MAC addresses,
//! image source paths, hostname, hosts table, interface configuration.
//!
//! Module map:
//! - [`clone`] - per-target orchestration
//! - [`descriptor`] - domain XML transformation
//! - [`hypervisor`] - libvirt driven through `virsh`
//! - [`imaging`] - reflink duplication and format sniffing
//! - [`nbd`] - block-device staging over the bounded `/dev/nbdN` pool
//! - [`layout`] - guest storage-topology classification
//! - [`mounts`] - scratch partition/overlay mounts with guaranteed teardown
//! - [`identity`] - hostname/hosts/network rewriting inside the guest

pub mod clone;
pub mod descriptor;
pub mod errors;
pub mod hypervisor;
pub mod identity;
pub mod ids;
pub mod imaging;
pub mod layout;
pub mod mounts;
pub mod nbd;
pub mod util;

pub use clone::{CloneEngine, CloneRequest, RunReport, TargetOutcome};
pub use errors::{DupError, DupResult};
pub use identity::NetworkMode;
pub use layout::GuestLayout;
