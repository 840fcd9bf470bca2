//! Shutdown coordination.

use tokio_util::sync::CancellationToken;

/// Process-wide shutdown trigger.
///
/// Clones share the same signal; tasks wait on [`Shutdown::triggered`].
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger the shutdown signal. Idempotent.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal has been triggered.
    pub async fn triggered(&self) {
        self.token.cancelled().await
    }

    /// A token cancelled with this shutdown, which can also be cancelled
    /// on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}
