//! FIFO queue of suspended acquisitions.

use std::{
    collections::VecDeque,
    sync::{atomic::AtomicBool, Arc},
};

use tokio::{sync::oneshot, time::Instant};

use crate::{context::ContextId, resource::PoolResource};

/// Resource being handed to a new owner, along with its revocation flag.
pub(crate) struct Checkout<R> {
    pub(crate) resource: PoolResource<R>,
    /// Raised when pool drain force-closes this checkout.
    pub(crate) revoked: Arc<AtomicBool>,
}

/// What a waiting acquisition is resumed with.
pub(crate) enum Grant<R> {
    /// Resource ready for use.
    Resource(Checkout<R>),
    /// Free slot reserved for the waiter, which opens a resource itself.
    Slot,
}

/// Suspended acquisition request.
pub(crate) struct WaitTicket<R> {
    id: u64,
    context: Option<ContextId>,
    deadline: Instant,
    signal: oneshot::Sender<Grant<R>>,
}

impl<R> WaitTicket<R> {
    /// Context that will own the resource.
    pub(crate) fn context(&self) -> Option<ContextId> {
        self.context
    }

    /// Resume the waiting acquisition with a resource.
    ///
    /// Returns the resource back if the waiter went away in the meantime.
    pub(crate) fn resume(self, checkout: Checkout<R>) -> Result<(), Checkout<R>> {
        self.signal
            .send(Grant::Resource(checkout))
            .map_err(|grant| match grant {
                Grant::Resource(checkout) => checkout,
                Grant::Slot => unreachable!("resource came back as a slot"),
            })
    }

    /// Resume the waiting acquisition with a reserved slot.
    ///
    /// Returns `false` if the waiter went away in the meantime.
    pub(crate) fn grant_slot(self) -> bool {
        self.signal.send(Grant::Slot).is_ok()
    }
}

/// Queue of waiting acquisitions, served strictly in arrival order.
pub(crate) struct WaitQueue<R> {
    tickets: VecDeque<WaitTicket<R>>,
    next_id: u64,
}

impl<R> Default for WaitQueue<R> {
    fn default() -> Self {
        Self {
            tickets: VecDeque::new(),
            next_id: 0,
        }
    }
}

impl<R> WaitQueue<R> {
    /// Number of queued tickets.
    pub(crate) fn len(&self) -> usize {
        self.tickets.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    /// Append a ticket to the tail of the queue.
    ///
    /// Returns ticket identifier and the receiving end of its resume signal.
    pub(crate) fn push(
        &mut self,
        context: Option<ContextId>,
        deadline: Instant,
    ) -> (u64, oneshot::Receiver<Grant<R>>) {
        let (signal, rx) = oneshot::channel();
        let id = self.next_id;
        self.next_id += 1;
        self.tickets.push_back(WaitTicket {
            id,
            context,
            deadline,
            signal,
        });
        (id, rx)
    }

    /// Remove a ticket, wherever it is in the queue.
    pub(crate) fn remove(&mut self, id: u64) -> bool {
        match self.tickets.iter().position(|t| t.id == id) {
            Some(pos) => {
                self.tickets.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Pop the oldest ticket that can still accept a resource.
    ///
    /// Tickets whose waiter is gone or whose deadline has passed are discarded along the way.
    pub(crate) fn pop_live(&mut self, now: Instant) -> Option<WaitTicket<R>> {
        while let Some(ticket) = self.tickets.pop_front() {
            if !ticket.signal.is_closed() && ticket.deadline > now {
                return Some(ticket);
            }
        }
        None
    }

    /// Drop all tickets, waking their waiters with a closed signal.
    pub(crate) fn clear(&mut self) -> usize {
        let num = self.tickets.len();
        self.tickets.clear();
        num
    }
}
