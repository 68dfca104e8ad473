//! A FIFO concurrency limiter.
//!
//! Every computation first [`submit`](AdmissionQueue::submit)s a [`Ticket`] and awaits it. The
//! queue grants at most `max_concurrent` tickets at a time, strictly in submission order. A
//! granted ticket turns into a [`Permit`], and the slot is released once that permit is dropped.
//!
//! ```text
//!   submit() ─► Ticket (queued) ── granted ──► Permit ── drop / release() ──► (consumed)
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::channel::oneshot;

use crate::error::{CacheError, ConfigError};

struct Waiter {
    sequence: u64,
    sender: oneshot::Sender<Permit>,
}

struct State {
    next_sequence: u64,
    granted: usize,
    waiters: VecDeque<Waiter>,
}

struct Shared {
    max_concurrent: usize,
    state: Mutex<State>,
}

impl Shared {
    /// Takes queued waiters in submission order while there are free slots.
    ///
    /// The returned waiters already count as granted, their permits are handed out by
    /// [`deliver`](Self::deliver) once `state` is unlocked.
    fn grant(&self, state: &mut State) -> Vec<Waiter> {
        let mut granted = Vec::new();
        while state.granted < self.max_concurrent {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            state.granted += 1;
            granted.push(waiter);
        }

        debug_assert!(
            state.granted <= self.max_concurrent,
            "{} granted tickets exceed the limit of {}",
            state.granted,
            self.max_concurrent,
        );
        granted
    }

    /// Sends permits to granted waiters.
    ///
    /// This must not be called while holding `state`: a permit can be dropped as part of sending
    /// it, which releases its slot again.
    fn deliver(self: &Arc<Self>, mut granted: Vec<Waiter>) {
        while !granted.is_empty() {
            let mut abandoned = 0;
            for waiter in granted.drain(..) {
                let permit = Permit {
                    queue: Arc::clone(self),
                    sequence: waiter.sequence,
                    armed: true,
                };
                // The ticket was dropped while it was queued, its slot goes to the next waiter.
                if let Err(mut permit) = waiter.sender.send(permit) {
                    permit.armed = false;
                    abandoned += 1;
                }
            }

            if abandoned > 0 {
                let mut state = self.state.lock().unwrap();
                state.granted -= abandoned;
                granted = self.grant(&mut state);
            }
        }
    }

    fn release(self: &Arc<Self>) {
        let granted = {
            let mut state = self.state.lock().unwrap();
            debug_assert!(state.granted > 0, "released more permits than granted");
            state.granted = state.granted.saturating_sub(1);
            self.grant(&mut state)
        };
        self.deliver(granted);
    }
}

/// Grants a bounded number of execution slots in submission order.
///
/// Cloning the queue yields another handle to the same slots.
#[derive(Clone)]
pub struct AdmissionQueue {
    shared: Arc<Shared>,
}

impl fmt::Debug for AdmissionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionQueue")
            .field("max_concurrent", &self.max_concurrent())
            .field("granted", &self.granted())
            .field("queued", &self.queued())
            .finish()
    }
}

impl AdmissionQueue {
    /// Creates a queue that grants at most `max_concurrent` tickets at the same time.
    pub fn new(max_concurrent: usize) -> Result<Self, ConfigError> {
        if max_concurrent == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        let state = State {
            next_sequence: 0,
            granted: 0,
            waiters: VecDeque::new(),
        };
        Ok(Self {
            shared: Arc::new(Shared {
                max_concurrent,
                state: Mutex::new(state),
            }),
        })
    }

    /// Enqueues a new ticket.
    ///
    /// The ticket is granted right away if a slot is free, otherwise once all tickets submitted
    /// before it have been granted and enough of them were released.
    pub fn submit(&self) -> Ticket {
        let (sender, receiver) = oneshot::channel();

        let (sequence, granted) = {
            let mut state = self.shared.state.lock().unwrap();
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.waiters.push_back(Waiter { sequence, sender });
            (sequence, self.shared.grant(&mut state))
        };
        self.shared.deliver(granted);

        Ticket { sequence, receiver }
    }

    /// The maximum number of concurrently granted tickets.
    pub fn max_concurrent(&self) -> usize {
        self.shared.max_concurrent
    }

    /// The number of currently granted tickets.
    pub fn granted(&self) -> usize {
        self.shared.state.lock().unwrap().granted
    }

    /// The number of tickets waiting for a slot.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().unwrap().waiters.len()
    }
}

/// A queued request for an execution slot.
///
/// Awaiting the ticket yields a [`Permit`] once the ticket has been granted. Dropping a ticket
/// before it was granted removes it from the queue.
#[derive(Debug)]
#[must_use = "a ticket does nothing unless awaited"]
pub struct Ticket {
    sequence: u64,
    receiver: oneshot::Receiver<Permit>,
}

impl Ticket {
    /// The submission order of this ticket.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl Future for Ticket {
    type Output = Result<Permit, CacheError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.map_err(|_canceled| CacheError::Cancelled))
    }
}

/// A granted execution slot.
///
/// The slot is given back to the queue when the permit is dropped.
#[must_use = "dropping a permit releases its slot immediately"]
pub struct Permit {
    queue: Arc<Shared>,
    sequence: u64,
    armed: bool,
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl Permit {
    /// The submission order of the ticket this permit was granted to.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Gives the slot back to the queue, possibly granting the next queued ticket.
    pub fn release(self) {
        drop(self)
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            self.queue.release();
        }
    }
}
