//! kiln-autoscale — the reconciliation loop.
//!
//! One implicit state per tick, nothing persisted between ticks:
//!
//! ```text
//! every tick (2s):
//!   every 500th tick: image stale or missing? → bake (blocks the tick)
//!   disposition ← backend listing
//!   deficit = target_idle − (idle + starting)
//!   deficit × { fresh token → create runner }   // sequential, fail-fast
//! on graceful shutdown:
//!   delete_runners(idle + starting, wait = true)  // exactly once
//! ```
//!
//! A failed bake or a failed tick is logged and the loop carries on; the
//! shortfall converges over subsequent ticks.

pub mod autoscaler;

pub use autoscaler::{Autoscaler, AutoscalerConfig, AutoscaleError};
