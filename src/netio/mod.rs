//! The single-task event loop driving every zone's refresh/retry timers
//! and the NOTIFY sender's retry timer.
//!
//! `netio.c` runs a single-threaded `pselect` loop over handlers carrying
//! an fd, an absolute-time deadline, and an interest mask; a dispatched
//! handler may remove itself or its successor, so the loop snapshots the
//! next pointer before invoking each callback (`dispatch_next`). Since
//! actual socket I/O here is driven by Tokio's own reactor (each
//! read/write is just an `await`), what's re-architected is the *timer*
//! half: one Tokio task multiplexing every zone's and every NOTIFY peer's
//! deadline through a single `tokio::select!`, using an index +
//! generation counter in place of the "next" pointer so that removing a
//! handler mid-dispatch can never resurrect a stale one.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

/// What a fired handler's callback asks the reactor to do next.
pub enum HandlerAction {
    /// Keep the handler registered, due again at the given deadline.
    Reschedule(Instant),
    /// Remove the handler; it will never fire again.
    Cancel,
}

type CallbackFuture = Pin<Box<dyn Future<Output = HandlerAction> + Send>>;
type Callback = Box<dyn FnMut() -> CallbackFuture + Send>;

/// A stable reference to a registered handler, valid until it fires its
/// last `Cancel` or is explicitly removed. Reusing a slot bumps
/// `generation`, so a [`HandlerId`] captured before reuse can never be
/// confused with the handler that replaced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandlerId {
    index: usize,
    generation: u64,
}

struct Slot {
    deadline: Instant,
    callback: Callback,
    generation: u64,
}

enum Command {
    Register {
        deadline: Instant,
        callback: Callback,
        reply: tokio::sync::oneshot::Sender<HandlerId>,
    },
    Remove(HandlerId),
    Reschedule(HandlerId, Instant),
    Shutdown,
}

/// A handle used by any task to register a timer-driven callback with the
/// reactor, without needing direct access to the reactor's own task.
#[derive(Clone)]
pub struct ReactorHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ReactorHandle {
    /// Register a new handler, due at `deadline`. The returned id stays
    /// valid until the callback returns [`HandlerAction::Cancel`] or
    /// [`ReactorHandle::remove`] is called.
    pub async fn register(
        &self,
        deadline: Instant,
        callback: impl FnMut() -> CallbackFuture + Send + 'static,
    ) -> Option<HandlerId> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.commands
            .send(Command::Register {
                deadline,
                callback: Box::new(callback),
                reply: reply_tx,
            })
            .ok()?;
        reply_rx.await.ok()
    }

    pub fn remove(&self, id: HandlerId) {
        let _ = self.commands.send(Command::Remove(id));
    }

    pub fn reschedule(&self, id: HandlerId, deadline: Instant) {
        let _ = self.commands.send(Command::Reschedule(id, deadline));
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// The reactor itself: owns the handler arena and runs the dispatch loop.
/// Spawn [`Reactor::run`] as a single task; every other task talks to it
/// through a cloned [`ReactorHandle`].
pub struct Reactor {
    slots: Vec<Option<Slot>>,
    free_list: Vec<usize>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    pub fn new() -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            commands_tx,
            commands_rx,
        }
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            commands: self.commands_tx.clone(),
        }
    }

    fn insert(&mut self, deadline: Instant, callback: Callback) -> HandlerId {
        let slot = Slot {
            deadline,
            callback,
            generation: 0,
        };
        if let Some(index) = self.free_list.pop() {
            let generation = self.slots[index]
                .as_ref()
                .map(|s| s.generation)
                .unwrap_or(0)
                .wrapping_add(1);
            let mut slot = slot;
            slot.generation = generation;
            let id = HandlerId { index, generation };
            self.slots[index] = Some(slot);
            id
        } else {
            let index = self.slots.len();
            let id = HandlerId {
                index,
                generation: 0,
            };
            self.slots.push(Some(slot));
            id
        }
    }

    fn remove(&mut self, id: HandlerId) {
        if let Some(slot) = self.slots.get_mut(id.index).and_then(|s| s.as_ref()) {
            if slot.generation != id.generation {
                return;
            }
        } else {
            return;
        }
        self.slots[id.index] = None;
        self.free_list.push(id.index);
    }

    fn reschedule(&mut self, id: HandlerId, deadline: Instant) {
        if let Some(Some(slot)) = self.slots.get_mut(id.index) {
            if slot.generation == id.generation {
                slot.deadline = deadline;
            }
        }
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.slots
            .iter()
            .flatten()
            .map(|slot| slot.deadline)
            .min()
    }

    /// Run the dispatch loop until [`ReactorHandle::shutdown`] is called.
    ///
    /// Each iteration: drain pending commands, compute the earliest
    /// deadline across all registered handlers, sleep until either that
    /// deadline or the next command arrives, then fire every handler
    /// whose deadline has passed. A handler that asks to be cancelled is
    /// removed before its callback's effects are observed by the next
    /// iteration, matching "no handler is ever invoked after its removal
    /// returns".
    pub async fn run(mut self) {
        loop {
            let sleep = match self.earliest_deadline() {
                Some(deadline) => tokio::time::sleep_until(deadline),
                None => tokio::time::sleep(Duration::from_secs(3600)),
            };
            tokio::pin!(sleep);

            tokio::select! {
                _ = &mut sleep => {
                    self.dispatch_due().await;
                }
                cmd = self.commands_rx.recv() => {
                    match cmd {
                        Some(Command::Register { deadline, callback, reply }) => {
                            let id = self.insert(deadline, callback);
                            let _ = reply.send(id);
                        }
                        Some(Command::Remove(id)) => self.remove(id),
                        Some(Command::Reschedule(id, deadline)) => self.reschedule(id, deadline),
                        Some(Command::Shutdown) | None => return,
                    }
                }
            }
        }
    }

    /// Fire every handler whose deadline has passed. Due handlers are
    /// collected first (their ids snapshotted) so that a callback
    /// removing another handler can't perturb this iteration, the
    /// `dispatch_next` problem in index form.
    async fn dispatch_due(&mut self) {
        let now = Instant::now();
        let due: Vec<HandlerId> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let slot = slot.as_ref()?;
                (slot.deadline <= now).then_some(HandlerId {
                    index,
                    generation: slot.generation,
                })
            })
            .collect();

        for id in due {
            let Some(Some(slot)) = self.slots.get_mut(id.index) else {
                continue;
            };
            if slot.generation != id.generation {
                continue;
            }
            let future = (slot.callback)();
            match future.await {
                HandlerAction::Reschedule(deadline) => self.reschedule(id, deadline),
                HandlerAction::Cancel => self.remove(id),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn a_handler_fires_once_then_cancels() {
        let reactor = Reactor::new();
        let handle = reactor.handle();
        let fire_count = Arc::new(AtomicUsize::new(0));

        let counter = fire_count.clone();
        handle
            .register(Instant::now() + Duration::from_secs(5), move || {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    HandlerAction::Cancel
                })
            })
            .await;

        let reactor_task = tokio::spawn(reactor.run());
        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        handle.shutdown();
        let _ = reactor_task.await;

        assert_eq!(fire_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn removing_a_handler_prevents_it_firing() {
        let reactor = Reactor::new();
        let handle = reactor.handle();
        let fire_count = Arc::new(AtomicUsize::new(0));

        let counter = fire_count.clone();
        let id = handle
            .register(Instant::now() + Duration::from_secs(5), move || {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    HandlerAction::Cancel
                })
            })
            .await
            .unwrap();

        handle.remove(id);

        let reactor_task = tokio::spawn(reactor.run());
        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        handle.shutdown();
        let _ = reactor_task.await;

        assert_eq!(fire_count.load(Ordering::SeqCst), 0);
    }
}
