//! kiln-cloudinit — composition of first-boot configuration documents.
//!
//! Two documents leave this crate:
//!
//! - the **prepare** document, injected into the short-lived bake
//!   instance: the embedded base template, with the pinned runner release
//!   version substituted, merged with any backend- and operator-supplied
//!   overlays;
//! - the **start** document, injected into every new runner: plain
//!   placeholder substitution of the registration URL, token, and labels.
//!
//! The merge is structural, not a patch language: an overlay can add
//! mapping keys, append sequence items, and overwrite scalars — it can
//! never delete or reorder what the base already has.

pub mod document;
pub mod merge;

pub use document::{CloudInitError, prepare_document, runner_document};
pub use merge::merge;
