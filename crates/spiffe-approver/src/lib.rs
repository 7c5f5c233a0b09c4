//! SPIFFE CertificateRequest approver
//!
//! A cluster-singleton controller that watches CertificateRequests created
//! by the SPIFFE CSI driver and approves or denies each one by applying a
//! strict identity policy over the CSR, the request metadata, and the
//! submitting ServiceAccount.

#![deny(missing_docs)]

pub mod controller;
pub mod evaluator;
pub mod leader_election;
pub mod probes;

pub use evaluator::{Denial, EcCurve, Evaluator};
