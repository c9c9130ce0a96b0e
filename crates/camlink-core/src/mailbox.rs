//! Single-consumer mailbox moving state updates from worker threads to
//! the controlling thread.
//!
//! Each lifecycle defines a closed enum of update operations; workers
//! `post` them and the controlling thread applies them in FIFO order when
//! it drains. An increment posted here is computed only at drain time, so
//! the worker-observed value of any controlling-thread field is
//! eventually-consistent at best; workers keep their own running counters
//! when they need a live value.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

type WakeHook = Arc<dyn Fn() + Send + Sync>;

struct Shared {
    /// Edge-triggered wake flag: set on the first post since the last
    /// drain, cleared when the drain begins.
    pending: AtomicBool,
    wake_hook: Mutex<Option<WakeHook>>,
}

impl Shared {
    fn trip_wake(&self) {
        if !self.pending.swap(true, Ordering::AcqRel) {
            let hook = self.wake_hook.lock().clone();
            if let Some(hook) = hook {
                hook();
            }
        }
    }
}

/// Worker half of a [`Mailbox`]. Cloneable across threads.
pub struct MailboxSender<T> {
    tx: flume::Sender<T>,
    shared: Arc<Shared>,
}

impl<T> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T> MailboxSender<T> {
    /// Queue one update. Never blocks, never panics; posting after the
    /// receiver is gone silently drops the update.
    pub fn post(&self, op: T) {
        if self.tx.send(op).is_err() {
            return;
        }
        self.shared.trip_wake();
    }

    /// Trip the wake edge without queuing an update. Used for coalesced
    /// notifications (e.g. a pending display refresh) that carry their
    /// payload elsewhere.
    pub fn wake(&self) {
        self.shared.trip_wake();
    }
}

/// Single-consumer mailbox owned by the controlling thread.
pub struct Mailbox<T> {
    rx: flume::Receiver<T>,
    tx: flume::Sender<T>,
    shared: Arc<Shared>,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            rx,
            tx,
            shared: Arc::new(Shared {
                pending: AtomicBool::new(false),
                wake_hook: Mutex::new(None),
            }),
        }
    }

    /// Mint a sender for a worker thread.
    pub fn sender(&self) -> MailboxSender<T> {
        MailboxSender {
            tx: self.tx.clone(),
            shared: self.shared.clone(),
        }
    }

    /// Install a hook invoked once per wake edge (many posts, one call)
    /// so an event loop can schedule a drain. The hook runs on whichever
    /// thread posts first; it must only signal, not do work.
    pub fn set_wake_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.shared.wake_hook.lock() = Some(Arc::new(hook));
    }

    /// True when posts (or wakes) arrived since the last drain.
    pub fn has_pending(&self) -> bool {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Drain all pending updates in FIFO order, applying each. Returns the
    /// number applied. The wake edge re-arms before the queue is read, so
    /// a post racing with the drain triggers a fresh wake.
    pub fn drain(&self, mut apply: impl FnMut(T)) -> usize {
        self.shared.pending.store(false, Ordering::Release);
        let mut applied = 0;
        for op in self.rx.try_iter() {
            apply(op);
            applied += 1;
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn drains_in_fifo_order() {
        let mailbox = Mailbox::new();
        let sender = mailbox.sender();
        for i in 0..5 {
            sender.post(i);
        }
        let mut seen = Vec::new();
        assert_eq!(mailbox.drain(|op| seen.push(op)), 5);
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn wake_hook_fires_once_per_edge() {
        let mailbox = Mailbox::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        mailbox.set_wake_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let sender = mailbox.sender();
        sender.post(1u32);
        sender.post(2);
        sender.post(3);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(mailbox.has_pending());

        mailbox.drain(|_| {});
        assert!(!mailbox.has_pending());

        // Edge re-arms after a drain.
        sender.post(4);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn post_after_receiver_dropped_is_silent() {
        let mailbox = Mailbox::new();
        let sender = mailbox.sender();
        drop(mailbox);
        sender.post(7u32);
    }

    #[test]
    fn posts_from_worker_threads_arrive() {
        let mailbox = Mailbox::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sender = mailbox.sender();
                std::thread::spawn(move || {
                    for i in 0..100u32 {
                        sender.post(i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let mut total = 0;
        mailbox.drain(|_| total += 1);
        assert_eq!(total, 400);
    }
}
