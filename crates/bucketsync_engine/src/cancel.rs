//! Hierarchical cancellation.

use futures::future::select_all;
use std::sync::Arc;
use tokio::sync::watch;

/// A cancellation signal shared by a sync session and everything it spawns.
///
/// Cancelling a token cancels every child derived from it. Cancelling a
/// child leaves the parent alone.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Node>,
}

#[derive(Debug)]
struct Node {
    tx: watch::Sender<bool>,
    parent: Option<CancelToken>,
}

impl CancelToken {
    /// Creates a root token.
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<CancelToken>) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Node { tx, parent }),
        }
    }

    /// Creates a token that is cancelled together with this one.
    pub fn child(&self) -> Self {
        Self::with_parent(Some(self.clone()))
    }

    /// Cancels this token and all its children.
    pub fn cancel(&self) {
        self.inner.tx.send_replace(true);
    }

    /// Returns true if this token or an ancestor was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.chain().any(|token| *token.inner.tx.borrow())
    }

    /// Resolves once this token or an ancestor is cancelled.
    pub async fn cancelled(&self) {
        let waits: Vec<_> = self
            .chain()
            .map(|token| {
                let mut rx = token.inner.tx.subscribe();
                Box::pin(async move {
                    let _ = rx.wait_for(|cancelled| *cancelled).await;
                })
            })
            .collect();
        select_all(waits).await;
    }

    fn chain(&self) -> impl Iterator<Item = &CancelToken> {
        std::iter::successors(Some(self), |token| token.inner.parent.as_ref())
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn parent_cancels_child() {
        let parent = CancelToken::new();
        let child = parent.child();
        let grandchild = child.child();

        let waiter = tokio::spawn({
            let grandchild = grandchild.clone();
            async move { grandchild.cancelled().await }
        });
        assert!(!grandchild.is_cancelled());

        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[tokio::test]
    async fn child_does_not_cancel_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let pending = tokio::time::timeout(Duration::from_millis(20), parent.cancelled()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn already_cancelled_resolves_immediately() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .unwrap();
    }
}
