//! Deterministic clinical rule engine for a CKD care platform.
//!
//! The crate owns four concerns:
//! - structured rule expressions and their pure, explainable evaluator
//!   ([`clinical::rules`]),
//! - per-evaluation patient data contexts assembled from independent
//!   collaborator stores ([`clinical::context`]),
//! - immutable risk/action snapshots derived from rule matches and domain
//!   heuristics ([`clinical::snapshot`] and [`clinical::service`]),
//! - the versioned, severity-gated rule approval workflow
//!   ([`clinical::versioning`]).
//!
//! Persistence and upstream data feeds are collaborator traits; the service
//! binary in `services/api` wires in-memory implementations for demos and
//! local operation.

pub mod clinical;
pub mod config;
pub mod error;
pub mod telemetry;
