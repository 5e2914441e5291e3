// src/fetch/cancel.rs

//! Cancellation token tree.
//!
//! A token fires once, with a reason, and every token derived from it fires
//! with the same reason. Children are held weakly: dropping a derived token
//! detaches it from its parent, so short-lived per-request tokens do not pile
//! up under a long-lived pipeline token.

use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;

/// Why a token fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// An owner (superseding trigger, shutdown, parent token) aborted the work.
    Cancelled,
    /// The token's own deadline elapsed.
    TimedOut,
}

struct Node {
    state: watch::Sender<Option<CancelReason>>,
    children: Mutex<Vec<Weak<Node>>>,
}

impl Node {
    fn new() -> Arc<Self> {
        let (state, _) = watch::channel(None);
        Arc::new(Self {
            state,
            children: Mutex::new(Vec::new()),
        })
    }

    fn fire(&self, reason: CancelReason) {
        // State first, children second: `child()` relies on this ordering.
        let fired = self.state.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(reason);
                true
            } else {
                false
            }
        });
        if !fired {
            return;
        }

        let children: Vec<Weak<Node>> = {
            let mut guard = self.children.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for child in children.iter().filter_map(Weak::upgrade) {
            child.fire(reason);
        }
    }
}

/// Handle to one node of the tree. Clones share the node.
#[derive(Clone)]
pub struct CancelToken {
    node: Arc<Node>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("reason", &self.reason())
            .finish()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A root token.
    pub fn new() -> Self {
        Self { node: Node::new() }
    }

    /// Derives a token that fires when `self` fires. A child of an already
    /// fired token is born fired.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        {
            let mut children = self.node.children.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(reason) = self.reason() {
                drop(children);
                child.node.fire(reason);
                return child;
            }
            children.retain(|weak| weak.strong_count() > 0);
            children.push(Arc::downgrade(&child.node));
        }
        child
    }

    pub fn cancel(&self) {
        self.node.fire(CancelReason::Cancelled);
    }

    pub fn cancel_with(&self, reason: CancelReason) {
        self.node.fire(reason);
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.node.state.borrow()
    }

    /// Resolves once the token fires, immediately if it already has.
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.node.state.subscribe();
        let reason = match rx.wait_for(|state| state.is_some()).await {
            Ok(state) => {
                let reason: Option<CancelReason> = *state;
                reason.unwrap_or(CancelReason::Cancelled)
            }
            // The sender lives in `self.node`, which we hold.
            Err(_) => CancelReason::Cancelled,
        };
        reason
    }

    /// Children that are still alive. Dead entries are not counted.
    pub fn live_children(&self) -> usize {
        self.node
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}
