//! # ACME Module
//!
//! Automatic TLS certificate provisioning over the HTTP-01 challenge, with
//! every persistent artifact routed through the sealed object store.

/// Certificate acquisition, renewal and TLS config assembly.
pub mod provisioner;

pub use provisioner::{install_default_crypto_provider, CertProvisioner, ProvisionError};
