// SPDX-License-Identifier: GPL-3.0
// work_queue.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use flume::{Receiver, Sender};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

#[cfg(test)]
mod tests;

/// This trait is implemented by whatever owns the state a work queue's
/// items act on. It lives on the worker thread and sees items in push order.
pub trait WorkHandler<W>: Send + 'static {

    /// Implementations must carry out one work item to completion.
    fn handle(&mut self, item: W);
}

/// Marks one item as finished when dropped, so a handler that panics still
/// releases its slot while the thread unwinds.
struct Outstanding<'a>(&'a AtomicUsize);

impl Drop for Outstanding<'_> {

    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Runs on the worker thread until every sender has gone.
fn worker<W, H: WorkHandler<W>>(mut handler: H, receiver: Receiver<W>, outstanding: Arc<AtomicUsize>) {

    while let Ok(item) = receiver.recv() {
        let _slot = Outstanding(&outstanding);
        handler.handle(item);
    }
}

/// This struct owns a named worker thread and the channel feeding it. Pushing
/// never blocks the caller, and items are handled one at a time in order.
pub struct WorkQueue<W: Send + 'static> {
    sender: Option<Sender<W>>,
    receiver: Receiver<W>,

    // Items pushed and not yet finished, queued ones included.
    outstanding: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl<W: Send + 'static> WorkQueue<W> {

    /// Spawns the worker thread, which takes ownership of the handler.
    pub fn new<H: WorkHandler<W>>(name: &str, handler: H) -> io::Result<Self> {

        let (sender, receiver) = flume::unbounded();
        let outstanding = Arc::new(AtomicUsize::new(0));

        let handle = thread::Builder::new()
            .name(name.into())
            .spawn({
                let receiver = receiver.clone();
                let outstanding = outstanding.clone();
                move || worker(handler, receiver, outstanding)
            })?;

        Ok(WorkQueue {
            sender: Some(sender),
            receiver,
            outstanding,
            handle: Some(handle),
        })
    }

    /// Returns true while the worker thread is still running. A handler that
    /// panics takes the thread down with it.
    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Queues an item for the worker. Items pushed after the worker has gone
    /// are dropped.
    pub fn push(&self, item: W) {

        let Some(sender) = self.sender.as_ref() else {
            return;
        };
        if !self.is_alive() {
            log::error!("work queue: worker thread has gone, item dropped");
            return;
        }

        self.outstanding.fetch_add(1, Ordering::AcqRel);
        if sender.send(item).is_err() {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            log::error!("work queue: worker thread has gone, item dropped");
        }
    }

    /// Drops every item not yet picked up. An item already being handled runs
    /// to completion.
    pub fn reset(&self) {

        let dropped = self.receiver.drain().count();
        if dropped > 0 {
            self.outstanding.fetch_sub(dropped, Ordering::AcqRel);
            log::debug!("work queue: dropped {} queued items", dropped);
        }
    }

    /// Returns true from the moment an item is pushed until it has been
    /// handled, so there is no gap between an item leaving the queue and the
    /// worker starting on it. A dead worker is never busy.
    pub fn busy(&self) -> bool {
        self.is_alive() && self.outstanding.load(Ordering::Acquire) > 0
    }

    /// Returns the number of items waiting to be picked up.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

impl<W: Send + 'static> Drop for WorkQueue<W> {

    fn drop(&mut self) {

        // Closing the channel ends the worker loop once the queue is empty.
        self.reset();
        self.sender = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("work queue: worker thread panicked");
            }
        }
    }
}
