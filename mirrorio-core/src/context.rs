use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Request-scoped operation context.
///
/// Carries the cancellation handle that follows an operation through every
/// backend it fans out to. The serving layer derives one child context per
/// inbound request; the replica layer derives one child per write so that
/// workers abandoned after an early quorum return can still be torn down.
///
/// Contexts are immutable after construction; cloning shares the same
/// token, `child` creates a token cancelled together with its parent.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    token: CancellationToken,
}

impl OpContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a context that is cancelled when either `self` is cancelled
    /// or `cancel` is called on the child itself.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the context is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}
