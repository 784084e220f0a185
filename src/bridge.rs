//! Channel bridge between a failure-prone producer task and a side-effect-free
//! consumer loop.
//!
//! Every behavior that needs to catch failures around stream advancement
//! follows the same shape: spawn one producer task that iterates the upstream
//! sequence, writes each item to a bridge, and closes the bridge on every exit
//! path — faulting it instead when the upstream failed. The consumer side is a
//! plain loop over [`BridgeReceiver::into_stream`] with no error handling of
//! its own; a fault surfaces exactly once, after all previously written items
//! have been drained.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// The reader has gone away (or the bridge was closed); the write was dropped.
#[derive(Debug, thiserror::Error)]
#[error("bridge closed")]
pub struct BridgeClosed;

/// Outcome of a bounded write with a deadline.
#[derive(Debug, thiserror::Error)]
pub enum BridgeSendTimeout {
    /// The reader has gone away; the write was dropped.
    #[error("bridge closed")]
    Closed,
    /// The channel stayed full past the deadline.
    #[error("bridge write timed out")]
    TimedOut,
}

enum Tx<M> {
    Bounded(mpsc::Sender<M>),
    Unbounded(mpsc::UnboundedSender<M>),
}

impl<M> Clone for Tx<M> {
    fn clone(&self) -> Self {
        match self {
            Tx::Bounded(tx) => Tx::Bounded(tx.clone()),
            Tx::Unbounded(tx) => Tx::Unbounded(tx.clone()),
        }
    }
}

enum Rx<M> {
    Bounded(mpsc::Receiver<M>),
    Unbounded(mpsc::UnboundedReceiver<M>),
}

impl<M> Rx<M> {
    async fn recv(&mut self) -> Option<M> {
        match self {
            Rx::Bounded(rx) => rx.recv().await,
            Rx::Unbounded(rx) => rx.recv().await,
        }
    }
}

struct Shared<E> {
    fault: Mutex<Option<E>>,
}

/// Write half of a bridge. Single-producer: owned by exactly one task.
///
/// Dropping the sender closes the bridge, so the close-on-every-exit-path
/// guarantee holds even when the producer task unwinds.
pub struct BridgeSender<M, E> {
    tx: Mutex<Option<Tx<M>>>,
    shared: Arc<Shared<E>>,
}

/// Read half of a bridge.
pub struct BridgeReceiver<M, E> {
    rx: Rx<M>,
    shared: Arc<Shared<E>>,
}

/// A bounded bridge: writes suspend while the channel holds `capacity` items.
pub fn bounded<M, E>(capacity: usize) -> (BridgeSender<M, E>, BridgeReceiver<M, E>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let shared = Arc::new(Shared { fault: Mutex::new(None) });
    (
        BridgeSender { tx: Mutex::new(Some(Tx::Bounded(tx))), shared: Arc::clone(&shared) },
        BridgeReceiver { rx: Rx::Bounded(rx), shared },
    )
}

/// An unbounded bridge: writes never suspend.
pub fn unbounded<M, E>() -> (BridgeSender<M, E>, BridgeReceiver<M, E>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared { fault: Mutex::new(None) });
    (
        BridgeSender { tx: Mutex::new(Some(Tx::Unbounded(tx))), shared: Arc::clone(&shared) },
        BridgeReceiver { rx: Rx::Unbounded(rx), shared },
    )
}

impl<M, E> BridgeSender<M, E> {
    fn current_tx(&self) -> Option<Tx<M>> {
        self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Write one item. Suspends while a bounded bridge is full.
    pub async fn send(&self, msg: M) -> Result<(), BridgeClosed> {
        match self.current_tx() {
            Some(Tx::Bounded(tx)) => tx.send(msg).await.map_err(|_| BridgeClosed),
            Some(Tx::Unbounded(tx)) => tx.send(msg).map_err(|_| BridgeClosed),
            None => Err(BridgeClosed),
        }
    }

    /// Write one item, giving up if a bounded bridge stays full past the
    /// deadline. Unbounded bridges never time out.
    pub async fn send_timeout(&self, msg: M, timeout: Duration) -> Result<(), BridgeSendTimeout> {
        match self.current_tx() {
            Some(Tx::Bounded(tx)) => tx.send_timeout(msg, timeout).await.map_err(|e| match e {
                mpsc::error::SendTimeoutError::Closed(_) => BridgeSendTimeout::Closed,
                mpsc::error::SendTimeoutError::Timeout(_) => BridgeSendTimeout::TimedOut,
            }),
            Some(Tx::Unbounded(tx)) => tx.send(msg).map_err(|_| BridgeSendTimeout::Closed),
            None => Err(BridgeSendTimeout::Closed),
        }
    }

    /// Close the bridge. Idempotent; the reader terminates after draining.
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
    }

    /// Close the bridge with an error that the reader surfaces after draining
    /// all previously written items. The first fault wins.
    pub fn fault(&self, err: E) {
        {
            let mut slot = self.shared.fault.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.close();
    }
}

impl<M, E> Drop for BridgeSender<M, E> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<M, E> BridgeReceiver<M, E>
where
    M: Send + 'static,
    E: Send + 'static,
{
    /// Consume the bridge as a stream. Items arrive in write order; a fault
    /// is yielded once, last, after every written item.
    pub fn into_stream(self) -> impl futures::Stream<Item = Result<M, E>> + Send + 'static {
        struct State<M, E> {
            rx: Rx<M>,
            shared: Arc<Shared<E>>,
            done: bool,
        }

        futures::stream::unfold(
            State { rx: self.rx, shared: self.shared, done: false },
            |mut state| async move {
                if state.done {
                    return None;
                }
                match state.rx.recv().await {
                    Some(msg) => Some((Ok(msg), state)),
                    None => {
                        state.done = true;
                        let fault = state
                            .shared
                            .fault
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .take();
                        fault.map(|err| (Err(err), state))
                    }
                }
            },
        )
    }
}
