use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{oneshot, Notify};
use tracing::warn;

use crate::envelope::Envelope;

struct State {
    envelopes: VecDeque<Envelope>,
    closed: bool,
}

/// FIFO envelope queue.
///
/// An envelope counts as in flight from the moment it is popped until every
/// delivery made from it has finished (the last clone of its [`Ticket`] is
/// dropped). The queue is idle when it is empty and nothing is in flight.
pub(crate) struct Scheduler {
    state: Mutex<State>,
    in_flight: AtomicUsize,
    activity: Notify,
    warn_threshold: usize,
}

/// In-flight marker for one popped envelope, shared by its deliveries.
pub(crate) struct Ticket {
    scheduler: Arc<Scheduler>,
    done: Option<oneshot::Sender<()>>,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
        self.scheduler.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.scheduler.activity.notify_waiters();
    }
}

pub(crate) struct Popped {
    pub envelope: Envelope,
    pub ticket: Arc<Ticket>,
    pub done: oneshot::Receiver<()>,
    /// Queue length right after this pop.
    pub behind: usize,
}

impl Scheduler {
    pub fn new(warn_threshold: usize) -> Self {
        Self {
            state: Mutex::new(State {
                envelopes: VecDeque::new(),
                closed: false,
            }),
            in_flight: AtomicUsize::new(0),
            activity: Notify::new(),
            warn_threshold,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue, or hand the envelope back if the queue is closed.
    pub fn push(&self, envelope: Envelope) -> Result<(), Envelope> {
        let backlog = {
            let mut state = self.state();
            if state.closed {
                return Err(envelope);
            }
            state.envelopes.push_back(envelope);
            state.envelopes.len()
        };
        if self.warn_threshold > 0 && backlog > self.warn_threshold {
            warn!(
                target: "runtime",
                backlog,
                threshold = self.warn_threshold,
                "Envelope queue backlog above threshold"
            );
        }
        self.activity.notify_waiters();
        Ok(())
    }

    pub fn pop(self: &Arc<Self>) -> Option<Popped> {
        self.pop_at(0)
    }

    /// Pop the envelope at `index`, leaving the `index` envelopes ahead of
    /// it queued.
    pub fn pop_at(self: &Arc<Self>, index: usize) -> Option<Popped> {
        let (envelope, behind) = {
            let mut state = self.state();
            let envelope = state.envelopes.remove(index)?;
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            (envelope, state.envelopes.len())
        };
        Some(self.issue(envelope, behind))
    }

    /// Pop every envelope ahead of `end` that `pick` accepts, in queue order.
    ///
    /// `pick` sees the candidates back to front, so it can grow its own
    /// selection as it goes.
    pub fn pop_picked_before<F>(self: &Arc<Self>, end: usize, mut pick: F) -> Vec<Popped>
    where
        F: FnMut(&Envelope) -> bool,
    {
        let (taken, behind) = {
            let mut state = self.state();
            let end = end.min(state.envelopes.len());
            let picked: Vec<usize> = (0..end)
                .rev()
                .filter(|&i| pick(&state.envelopes[i]))
                .collect();
            // Descending, so each removal leaves the remaining indices valid.
            let mut taken: Vec<Envelope> = picked
                .into_iter()
                .filter_map(|i| state.envelopes.remove(i))
                .collect();
            taken.reverse();
            self.in_flight.fetch_add(taken.len(), Ordering::SeqCst);
            (taken, state.envelopes.len())
        };
        taken
            .into_iter()
            .map(|envelope| self.issue(envelope, behind))
            .collect()
    }

    fn issue(self: &Arc<Self>, envelope: Envelope, behind: usize) -> Popped {
        let (tx, rx) = oneshot::channel();
        Popped {
            envelope,
            ticket: Arc::new(Ticket {
                scheduler: Arc::clone(self),
                done: Some(tx),
            }),
            done: rx,
            behind,
        }
    }

    pub fn len(&self) -> usize {
        self.state().envelopes.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        let state = self.state();
        state.envelopes.is_empty() && self.in_flight.load(Ordering::SeqCst) == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Close the queue and take everything still in it.
    pub fn close(&self) -> Vec<Envelope> {
        let drained: Vec<Envelope> = {
            let mut state = self.state();
            state.closed = true;
            state.envelopes.drain(..).collect()
        };
        self.activity.notify_waiters();
        drained
    }

    pub fn reopen(&self) {
        self.state().closed = false;
    }

    /// Resolves on the next push or completion after the call.
    pub fn activity(&self) -> tokio::sync::futures::Notified<'_> {
        self.activity.notified()
    }

    pub async fn wait_idle(&self) {
        loop {
            let notified = self.activity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}
