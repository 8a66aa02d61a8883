//! kiln-github — the two GitHub collaborators the autoscaler needs.
//!
//! Both are single request/response calls with no retry logic: failures
//! surface to the reconciliation loop, which defers to the next tick.
//!
//! - [`RegistrationTokenProvider`] exchanges a personal access token for a
//!   one-time runner registration token before every runner creation.
//! - [`ReleaseClient`] resolves the latest `actions/runner` release tag so
//!   the prepare document pins a concrete runner version.

pub mod releases;
pub mod token;

pub use releases::ReleaseClient;
pub use token::RegistrationTokenProvider;

const API_ROOT: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("kiln/", env!("CARGO_PKG_VERSION"));
