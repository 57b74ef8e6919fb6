use std::{
    num::NonZeroUsize,
    pin::pin,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use log::{debug, warn};
use tokio::sync::Notify;

use crate::{
    CommsErr, Result,
    mailbox::{Mailbox, MailboxErr},
    msg::{RoundResult, Upload},
};

/// The channel fabric between one server and `worker_num` workers.
///
/// Owns one inbound and one outbound mailbox per worker, each one FIFO.
/// Shared by reference (`Arc`) between every endpoint of a training task.
pub struct Topology {
    worker_num: usize,
    to_server: Box<[Mailbox<Upload>]>,
    to_worker: Box<[Mailbox<RoundResult>]>,
    open_clients: AtomicUsize,
    client_closed: Notify,
    aborted: AtomicBool,
}

impl Topology {
    /// Creates a new `Topology`.
    ///
    /// # Arguments
    /// * `worker_num` - The amount of workers connected to the server.
    /// * `capacity` - The amount of messages each mailbox can hold before `send` suspends.
    pub fn new(worker_num: usize, capacity: NonZeroUsize) -> Self {
        Self {
            worker_num,
            to_server: (0..worker_num).map(|_| Mailbox::new(capacity)).collect(),
            to_worker: (0..worker_num).map(|_| Mailbox::new(capacity)).collect(),
            open_clients: AtomicUsize::new(worker_num),
            client_closed: Notify::new(),
            aborted: AtomicBool::new(false),
        }
    }

    pub fn worker_num(&self) -> usize {
        self.worker_num
    }

    pub async fn send_to_worker(&self, data: RoundResult, worker_id: usize) -> Result<()> {
        let mailbox = self.mailbox(&self.to_worker, worker_id)?;
        mailbox
            .send(data)
            .await
            .map_err(|e| self.translate(e, worker_id, "the worker closed its channel"))
    }

    pub async fn get_from_worker(&self, worker_id: usize) -> Result<Upload> {
        let mailbox = self.mailbox(&self.to_server, worker_id)?;
        mailbox
            .recv()
            .await
            .map_err(|e| self.translate(e, worker_id, "the worker closed before sending"))
    }

    /// Whether the worker has a queued message for the server, never blocks.
    pub fn worker_has_data(&self, worker_id: usize) -> bool {
        self.to_server.get(worker_id).is_some_and(Mailbox::has_data)
    }

    pub async fn send_to_server(&self, worker_id: usize, data: Upload) -> Result<()> {
        let mailbox = self.mailbox(&self.to_server, worker_id)?;
        mailbox
            .send(data)
            .await
            .map_err(|e| self.translate(e, worker_id, "the channel to the server is closed"))
    }

    pub async fn get_from_server(&self, worker_id: usize) -> Result<RoundResult> {
        let mailbox = self.mailbox(&self.to_worker, worker_id)?;
        mailbox
            .recv()
            .await
            .map_err(|e| self.translate(e, worker_id, "the channel was closed before a result arrived"))
    }

    /// Whether the server has a queued message for the worker, never blocks.
    pub fn server_has_data(&self, worker_id: usize) -> bool {
        self.to_worker.get(worker_id).is_some_and(Mailbox::has_data)
    }

    /// Closes the channel pair of a worker.
    ///
    /// Messages the worker never read are discarded. Closing twice is a no-op.
    ///
    /// # Returns
    /// A `ProtocolViolation` if the server was waiting for this worker's data.
    pub fn close(&self, worker_id: usize) -> Result<()> {
        let inbound = self.mailbox(&self.to_server, worker_id)?;
        let outbound = self.mailbox(&self.to_worker, worker_id)?;

        let server_waiting = inbound.is_starved();

        if !outbound.close() {
            return Ok(());
        }

        inbound.close();

        let discarded = outbound.drain();
        if discarded > 0 {
            debug!(worker_id = worker_id, discarded = discarded; "discarded undelivered results");
        }

        if self.open_clients.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.client_closed.notify_waiters();
        }

        if server_waiting {
            return Err(CommsErr::ProtocolViolation {
                worker_id,
                detail: "closed while the server waits for its update".into(),
            });
        }

        Ok(())
    }

    /// Waits until every worker closed its channel pair, then discards every
    /// message the server never read.
    ///
    /// # Returns
    /// The amount of discarded messages, or a `ProtocolViolation` if a worker
    /// is still waiting for data that will never come.
    pub async fn wait_close(&self) -> Result<usize> {
        loop {
            let mut notified = pin!(self.client_closed.notified());
            notified.as_mut().enable();

            if self.is_aborted() {
                return Err(CommsErr::Aborted);
            }

            if self.open_clients.load(Ordering::Acquire) == 0 {
                break;
            }

            if let Some(worker_id) = self.stalled_worker() {
                return Err(CommsErr::ProtocolViolation {
                    worker_id,
                    detail: "the server closed while the worker waits for data".into(),
                });
            }

            notified.await;
        }

        let discarded: usize = self.to_server.iter().map(Mailbox::drain).sum();
        if discarded > 0 {
            debug!(discarded = discarded; "discarded unread worker messages");
        }

        Ok(discarded)
    }

    /// Tears the topology down, every pending and future operation fails with `Aborted`.
    pub fn abort(&self) {
        if self.aborted.swap(true, Ordering::AcqRel) {
            return;
        }

        warn!("aborting topology");

        for mailbox in self.to_server.iter() {
            mailbox.close();
        }

        for mailbox in self.to_worker.iter() {
            mailbox.close();
        }

        self.client_closed.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    fn stalled_worker(&self) -> Option<usize> {
        self.to_worker.iter().position(Mailbox::is_starved)
    }

    fn mailbox<'a, T>(&self, mailboxes: &'a [Mailbox<T>], worker_id: usize) -> Result<&'a Mailbox<T>> {
        if self.is_aborted() {
            return Err(CommsErr::Aborted);
        }

        mailboxes.get(worker_id).ok_or(CommsErr::UnknownWorker {
            worker_id,
            worker_num: self.worker_num,
        })
    }

    fn translate(&self, err: MailboxErr, worker_id: usize, detail: &'static str) -> CommsErr {
        if self.is_aborted() {
            return CommsErr::Aborted;
        }

        match err {
            MailboxErr::Closed => CommsErr::Transport { worker_id, detail },
            MailboxErr::ClosedWhileWaiting => CommsErr::ProtocolViolation {
                worker_id,
                detail: detail.into(),
            },
        }
    }
}
