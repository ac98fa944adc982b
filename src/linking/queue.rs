use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// First-come first-served serialization of deployment sessions.
///
/// Every caller draws a ticket and waits until the queue reaches it, so
/// sessions against one destination run strictly in the order they asked.
#[derive(Debug, Clone, Default)]
pub struct DeployQueue {
    shared: Arc<QueueShared>,
}

#[derive(Debug, Default)]
struct QueueShared {
    counters: Mutex<Counters>,
    turn: Condvar,
}

#[derive(Debug, Default)]
struct Counters {
    next: u64,
    serving: u64,
}

impl QueueShared {
    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DeployQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until every earlier ticket has been released.
    pub fn enqueue(&self) -> QueueTicket {
        let mut counters = self.shared.lock();
        let ticket = counters.next;
        counters.next += 1;
        while counters.serving != ticket {
            counters = self
                .shared
                .turn
                .wait(counters)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        QueueTicket {
            shared: self.shared.clone(),
            number: ticket,
        }
    }

    /// Sessions holding or waiting for a ticket.
    pub fn pending(&self) -> u64 {
        let counters = self.shared.lock();
        counters.next - counters.serving
    }
}

/// Held for the lifetime of a session. Dropping it lets the next one proceed.
#[derive(Debug)]
pub struct QueueTicket {
    shared: Arc<QueueShared>,
    number: u64,
}

impl QueueTicket {
    pub fn number(&self) -> u64 {
        self.number
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        let mut counters = self.shared.lock();
        counters.serving += 1;
        drop(counters);
        self.shared.turn.notify_all();
    }
}
