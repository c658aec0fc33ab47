//! Notification queues between the consumer and the dispatcher thread
//!
//! Two one-directional queues connect the two long-lived threads of control:
//! work items flow to the dispatcher, result items flow back. Both are
//! unbounded so posting never blocks the producer.

use crate::CancelToken;
use async_channel::{Receiver, Sender, TryRecvError, unbounded};
use protocol::{Command, ResultItem, WorkItem};
use tracing::{debug, warn};

/// Thread-safe FIFO
///
/// Every clone refers to the same queue. Because the queue keeps both of its
/// ends, it only closes when [`NotificationQueue::close`] is called.
#[derive(Debug)]
pub struct NotificationQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Clone for NotificationQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> Default for NotificationQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> NotificationQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Append an item; never blocks
    ///
    /// Posting to a closed queue drops the item.
    pub fn post(&self, item: T) {
        if self.tx.try_send(item).is_err() {
            warn!("Dropping item posted to a closed queue");
        }
    }

    /// Pop the oldest item without blocking
    pub fn try_pop(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Pop the oldest item, blocking the calling thread
    ///
    /// Returns `None` once the queue is closed and drained.
    pub fn pop_blocking(&self) -> Option<T> {
        self.rx.recv_blocking().ok()
    }

    /// Pop the oldest item from async context
    pub async fn pop(&self) -> Option<T> {
        self.rx.recv().await.ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Close the queue; queued items can still be popped
    pub fn close(&self) {
        self.tx.close();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side of the bridge
#[derive(Debug, Clone)]
pub struct InstrumentBridge {
    work: NotificationQueue<WorkItem>,
    results: NotificationQueue<ResultItem>,
    cancel: CancelToken,
}

impl InstrumentBridge {
    /// Queue a work item for the dispatcher
    ///
    /// An `Abort` item raises the cancel token immediately so the operation in
    /// progress stops within one poll interval; the dispatcher resets the token
    /// when it reaches the item.
    pub fn submit(&self, item: WorkItem) {
        if item.command == Command::Abort {
            debug!("Abort requested");
            self.cancel.request();
        }
        self.work.post(item);
    }

    /// Cancel the running and all queued operations
    pub fn abort(&self) {
        self.submit(WorkItem::new(Command::Abort));
    }

    /// Ask the dispatcher to shut down after the queued items
    pub fn shutdown(&self) {
        self.submit(WorkItem::end());
    }

    /// Receive the next result from async context
    pub async fn recv_result(&self) -> crate::Result<ResultItem> {
        self.results
            .pop()
            .await
            .ok_or_else(|| crate::Error::Channel("result queue closed".to_string()))
    }

    /// Receive the next result, blocking the calling thread
    pub fn recv_result_blocking(&self) -> crate::Result<ResultItem> {
        self.results
            .pop_blocking()
            .ok_or_else(|| crate::Error::Channel("result queue closed".to_string()))
    }

    /// Non-blocking poll of the result queue
    pub fn try_pop_result(&self) -> Option<ResultItem> {
        self.results.try_pop()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

/// Dispatcher side of the bridge
#[derive(Debug)]
pub struct DispatcherEndpoint {
    work: NotificationQueue<WorkItem>,
    results: NotificationQueue<ResultItem>,
    cancel: CancelToken,
}

impl DispatcherEndpoint {
    /// Receive the next work item (blocking)
    pub fn recv_work(&self) -> crate::Result<WorkItem> {
        self.work
            .pop_blocking()
            .ok_or_else(|| crate::Error::Channel("work queue closed".to_string()))
    }

    /// Try to receive a work item without blocking
    pub fn try_recv_work(&self) -> Option<WorkItem> {
        self.work.try_pop()
    }

    /// Post a result for the consumer; never blocks
    pub fn post(&self, item: ResultItem) {
        self.results.post(item);
    }

    /// Queue used for results, for handing to the protocol layer
    pub fn results(&self) -> &NotificationQueue<ResultItem> {
        &self.results
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Close the result queue once the dispatcher exits
    pub fn close(&self) {
        self.results.close();
    }
}

/// Create the bridge between the consumer and the dispatcher thread
///
/// Returns (InstrumentBridge for the consumer, DispatcherEndpoint for the dispatcher)
pub fn create_bridge() -> (InstrumentBridge, DispatcherEndpoint) {
    let work = NotificationQueue::new();
    let results = NotificationQueue::new();
    let cancel = CancelToken::new();

    (
        InstrumentBridge {
            work: work.clone(),
            results: results.clone(),
            cancel: cancel.clone(),
        },
        DispatcherEndpoint {
            work,
            results,
            cancel,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_channel_bridge() {
        let (bridge, endpoint) = create_bridge();

        let handle = std::thread::spawn(move || {
            let item = endpoint.recv_work().unwrap();
            endpoint.post(ResultItem::info(item.command.name()));
            matches!(item.command, Command::MeasureMultiPort)
        });

        bridge.submit(WorkItem::new(Command::MeasureMultiPort));
        let result = bridge.recv_result().await.unwrap();

        assert_eq!(result.message.as_deref(), Some("measure-multi-port"));
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_try_pop_empty() {
        let queue: NotificationQueue<u32> = NotificationQueue::new();
        assert!(queue.try_pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_abort_raises_token_before_dispatch() {
        let (bridge, endpoint) = create_bridge();
        bridge.abort();

        assert!(endpoint.cancel_token().is_requested());
        let item = endpoint.try_recv_work().unwrap();
        assert_eq!(item.command, Command::Abort);
    }

    #[test]
    fn test_closed_queue_drains_then_ends() {
        let queue = NotificationQueue::new();
        queue.post(1);
        queue.close();
        queue.post(2);

        assert_eq!(queue.pop_blocking(), Some(1));
        assert_eq!(queue.pop_blocking(), None);
    }

    proptest! {
        #[test]
        fn prop_fifo_no_loss_no_duplication(items in proptest::collection::vec(any::<u32>(), 0..200)) {
            let queue = NotificationQueue::new();
            for item in &items {
                queue.post(*item);
            }
            let mut popped = Vec::new();
            while let Some(item) = queue.try_pop() {
                popped.push(item);
            }
            prop_assert_eq!(popped, items);
        }
    }
}
