//! Registration-token collaborator contract.

/// Supplies runner registration credentials to the reconciliation loop.
pub trait TokenProvider {
    /// The registration URL runners attach to. Stable for the lifetime of
    /// the process.
    fn url(&self) -> String;

    /// Fetch a fresh one-time registration token.
    ///
    /// Tokens are single-use: the loop calls this immediately before every
    /// runner creation and never caches the result.
    fn token(&self) -> impl Future<Output = anyhow::Result<String>> + Send;
}
