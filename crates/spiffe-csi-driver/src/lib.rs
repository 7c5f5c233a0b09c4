//! SPIFFE CSI node driver
//!
//! A node-local daemon implementing the CSI `Identity` and `Node` services.
//! Each `NodePublishVolume` derives the Pod's SPIFFE identity from its
//! ServiceAccount token, obtains a signed certificate through a
//! CertificateRequest, and materialises the keypair into the Pod's volume.
//! Certificates are renewed before expiry and trust-bundle rotations are
//! propagated to every managed volume.

#![deny(missing_docs)]

pub mod camanager;
pub mod identity;
pub mod manager;
pub mod mount;
pub mod proto;
pub mod rootca;
pub mod runtime_config;
pub mod server;
pub mod store;

/// Version reported through the CSI Identity service
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");
