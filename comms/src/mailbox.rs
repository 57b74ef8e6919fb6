use std::{collections::VecDeque, num::NonZeroUsize, pin::pin};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Why a mailbox operation couldn't complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MailboxErr {
    /// The mailbox was closed before the operation started.
    Closed,
    /// The mailbox was closed while the operation was waiting.
    ClosedWhileWaiting,
}

struct State<T> {
    queue: VecDeque<T>,
    /// Receivers suspended in `recv`.
    waiting: usize,
    closed: bool,
}

/// One direction of a worker's channel pair.
///
/// A bounded FIFO queue. `send` and `recv` are the only suspension points,
/// every other method only takes the state lock. A receiver stops counting
/// as waiting under the same lock that hands it a message.
pub(crate) struct Mailbox<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
}

/// Deregisters a cancelled `recv` from the waiting count.
struct Waiter<'a, T> {
    mailbox: &'a Mailbox<T>,
    registered: bool,
}

impl<T> Drop for Waiter<'_, T> {
    fn drop(&mut self) {
        if self.registered {
            self.mailbox.state.lock().waiting -= 1;
        }
    }
}

impl<T> Mailbox<T> {
    pub(crate) fn new(capacity: NonZeroUsize) -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(capacity.get()),
                waiting: 0,
                closed: false,
            }),
            capacity: capacity.get(),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Whether there is at least one queued message.
    pub(crate) fn has_data(&self) -> bool {
        !self.state.lock().queue.is_empty()
    }

    /// Whether a receiver is currently suspended in `recv`.
    #[cfg(test)]
    fn is_waiting(&self) -> bool {
        self.state.lock().waiting > 0
    }

    /// Whether an open mailbox has a suspended receiver and nothing queued for it.
    ///
    /// All three conditions are read under one lock, so a message that was
    /// just handed over never shows up as a starving receiver.
    pub(crate) fn is_starved(&self) -> bool {
        let state = self.state.lock();
        !state.closed && state.waiting > 0 && state.queue.is_empty()
    }

    /// Enqueues `data`, waiting for room if the mailbox is full.
    pub(crate) async fn send(&self, data: T) -> Result<(), MailboxErr> {
        let mut waited = false;

        loop {
            let mut notified = pin!(self.writable.notified());
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();

                if state.closed {
                    return Err(match waited {
                        true => MailboxErr::ClosedWhileWaiting,
                        false => MailboxErr::Closed,
                    });
                }

                if state.queue.len() < self.capacity {
                    state.queue.push_back(data);
                    drop(state);
                    self.readable.notify_one();
                    return Ok(());
                }
            }

            waited = true;
            notified.await;
        }
    }

    /// Waits for the next message. Queued messages are still delivered after closing.
    pub(crate) async fn recv(&self) -> Result<T, MailboxErr> {
        let mut waiter = Waiter {
            mailbox: self,
            registered: false,
        };

        loop {
            let mut notified = pin!(self.readable.notified());
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();

                if let Some(data) = state.queue.pop_front() {
                    if waiter.registered {
                        state.waiting -= 1;
                        waiter.registered = false;
                    }
                    drop(state);
                    self.writable.notify_one();
                    return Ok(data);
                }

                if state.closed {
                    let err = match waiter.registered {
                        true => MailboxErr::ClosedWhileWaiting,
                        false => MailboxErr::Closed,
                    };
                    if waiter.registered {
                        state.waiting -= 1;
                        waiter.registered = false;
                    }
                    return Err(err);
                }

                if !waiter.registered {
                    state.waiting += 1;
                    waiter.registered = true;
                }
            }

            notified.await;
        }
    }

    /// Closes the mailbox and wakes every suspended operation.
    ///
    /// # Returns
    /// `false` if it was already closed.
    pub(crate) fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
        }

        self.readable.notify_waiters();
        self.writable.notify_waiters();
        true
    }

    /// Discards every queued message.
    ///
    /// # Returns
    /// The amount of discarded messages.
    pub(crate) fn drain(&self) -> usize {
        let discarded = {
            let mut state = self.state.lock();
            let discarded = state.queue.len();
            state.queue.clear();
            discarded
        };

        if discarded > 0 {
            self.writable.notify_waiters();
        }

        discarded
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn mailbox(capacity: usize) -> Mailbox<u32> {
        Mailbox::new(NonZeroUsize::new(capacity).unwrap())
    }

    #[tokio::test]
    async fn test_fifo_and_peek() {
        let mailbox = mailbox(4);
        assert!(!mailbox.has_data());

        mailbox.send(1).await.unwrap();
        mailbox.send(2).await.unwrap();
        assert!(mailbox.has_data());

        assert_eq!(mailbox.recv().await, Ok(1));
        assert_eq!(mailbox.recv().await, Ok(2));
        assert!(!mailbox.has_data());
    }

    #[tokio::test]
    async fn test_queued_data_survives_close() {
        let mailbox = mailbox(2);
        mailbox.send(7).await.unwrap();

        assert!(mailbox.close());
        assert!(!mailbox.close());

        assert_eq!(mailbox.send(8).await, Err(MailboxErr::Closed));
        assert_eq!(mailbox.recv().await, Ok(7));
        assert_eq!(mailbox.recv().await, Err(MailboxErr::Closed));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_close_wakes_waiting_receiver() {
        let mailbox = Arc::new(mailbox(1));

        let receiver = tokio::spawn({
            let mailbox = Arc::clone(&mailbox);
            async move { mailbox.recv().await }
        });

        while !mailbox.is_waiting() {
            tokio::task::yield_now().await;
        }

        mailbox.close();
        assert_eq!(receiver.await.unwrap(), Err(MailboxErr::ClosedWhileWaiting));
        assert!(!mailbox.is_waiting());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handed_over_message_never_looks_starved() {
        let mailbox = Arc::new(mailbox(1));

        for i in 0..1_000 {
            let receiver = tokio::spawn({
                let mailbox = Arc::clone(&mailbox);
                async move { mailbox.recv().await }
            });

            while !mailbox.is_waiting() {
                tokio::task::yield_now().await;
            }
            assert!(mailbox.is_starved());

            mailbox.send(i).await.unwrap();
            assert!(!mailbox.is_starved(), "iteration {i}");

            assert_eq!(receiver.await.unwrap(), Ok(i));
            assert!(!mailbox.is_waiting());
            assert!(!mailbox.is_starved());
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_cancelled_recv_stops_waiting() {
        let mailbox = mailbox(1);

        let res = tokio::time::timeout(std::time::Duration::from_millis(10), mailbox.recv()).await;
        assert!(res.is_err());
        assert!(!mailbox.is_waiting());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_close_wakes_blocked_sender() {
        let mailbox = Arc::new(mailbox(1));
        mailbox.send(1).await.unwrap();

        let sender = tokio::spawn({
            let mailbox = Arc::clone(&mailbox);
            async move { mailbox.send(2).await }
        });
        tokio::task::yield_now().await;

        mailbox.close();
        assert_eq!(sender.await.unwrap(), Err(MailboxErr::ClosedWhileWaiting));
        assert_eq!(mailbox.recv().await, Ok(1));
    }

    #[tokio::test]
    async fn test_drain_counts_discarded() {
        let mailbox = mailbox(3);
        for i in 0..3 {
            mailbox.send(i).await.unwrap();
        }

        assert_eq!(mailbox.drain(), 3);
        assert!(!mailbox.has_data());
    }
}
