//! Cooperative cancellation shared by everything spawned for one client.

use tokio_util::sync::CancellationToken;

/// Shared cancelled flag.
///
/// Clones observe the same flag. [`child`](Self::child) tokens are cancelled
/// with their parent but can be cancelled on their own without affecting it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(CancellationToken);

impl CancelToken {
    pub fn new() -> Self {
        Self(CancellationToken::new())
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        self.0.cancelled().await
    }

    pub fn child(&self) -> CancelToken {
        Self(self.0.child_token())
    }
}
