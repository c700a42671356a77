//! One-shot completion handles for scheduled batches.
//!
//! The producer side ([`Completion`]) is owned by the batch; any number of
//! [`BatchFuture`]s observe it. The first resolution wins, later ones are
//! ignored, and resolving never interrupts anybody.

use std::future::IntoFuture;

use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::error::ReplicationError;

pub type BatchOutcome = Result<(), ReplicationError>;

/// Producer half of a batch completion.
#[derive(Debug)]
pub struct Completion {
    tx: watch::Sender<Option<BatchOutcome>>,
}

impl Completion {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Resolves the completion. Returns `false` if it was already resolved.
    pub fn complete(&self, outcome: BatchOutcome) -> bool {
        let mut outcome = Some(outcome);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }

    pub fn succeed(&self) -> bool {
        self.complete(Ok(()))
    }

    pub fn fail(&self, err: ReplicationError) -> bool {
        self.complete(Err(err))
    }

    pub fn is_done(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn is_failed(&self) -> bool {
        matches!(&*self.tx.borrow(), Some(Err(_)))
    }

    /// A new observer. Every observer of one completion is [`BatchFuture::same_as`] the others.
    pub fn future(&self) -> BatchFuture {
        BatchFuture {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer half of a batch completion. Cheap to clone; await it directly or
/// through [`BatchFuture::wait`].
#[derive(Debug, Clone)]
pub struct BatchFuture {
    rx: watch::Receiver<Option<BatchOutcome>>,
}

impl BatchFuture {
    /// An already successful future, not tied to any batch.
    pub fn completed() -> Self {
        Self::resolved(Ok(()))
    }

    /// An already failed future, not tied to any batch.
    pub fn failed(err: ReplicationError) -> Self {
        Self::resolved(Err(err))
    }

    fn resolved(outcome: BatchOutcome) -> Self {
        let (_tx, rx) = watch::channel(Some(outcome));
        Self { rx }
    }

    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The outcome, if resolved, without waiting.
    pub fn peek(&self) -> Option<BatchOutcome> {
        self.rx.borrow().clone()
    }

    /// Whether both futures observe the same completion.
    pub fn same_as(&self, other: &BatchFuture) -> bool {
        self.rx.same_channel(&other.rx)
    }

    pub async fn wait(mut self) -> BatchOutcome {
        let outcome = match self.rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone(),
            Err(_) => None,
        };
        // A producer dropped without resolving leaves the waiter nothing to wait for.
        outcome.unwrap_or(Err(ReplicationError::Abandoned))
    }
}

impl IntoFuture for BatchFuture {
    type Output = BatchOutcome;
    type IntoFuture = BoxFuture<'static, BatchOutcome>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}
