//! kiln-core — shared contracts for the kiln runner autoscaler.
//!
//! Defines the capability contract every compute backend implements
//! ([`Backend`]), the registration-token collaborator ([`TokenProvider`]),
//! the runner disposition model with its pure classifier, and the error
//! taxonomy backends report through.
//!
//! The core holds no long-lived state: a [`RunnerDisposition`] is computed
//! fresh from a backend listing on every reconciliation tick and discarded
//! afterwards.

pub mod backend;
pub mod disposition;
pub mod error;
pub mod token;

pub use backend::{Backend, PrepareOptions};
pub use disposition::{
    InstanceObservation, InstancePhase, RunnerDisposition, RunnerState, classify,
};
pub use error::{BackendError, BackendResult};
pub use token::TokenProvider;
