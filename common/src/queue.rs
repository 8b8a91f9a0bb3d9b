//! Receiving side of a worker's queue, including the cooperative shutdown protocol.
//!
//! Every worker pulls its items through a [`WorkQueue`]:
//!
//! ```text
//!   RUNNING --stop signal--> DRAINING --queue empty--> STOPPED
//!      |                                                 ^
//!      +------------- queue closed and empty ------------+
//! ```
//!
//! While RUNNING the worker waits on both the channel and the stop token, so it wakes up
//! immediately on either. Once the token is cancelled the queue switches to non-blocking receives
//! and hands out whatever is still queued, so nothing enqueued before the stop signal is lost.

use tokio_util::sync::CancellationToken;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Draining,
    Stopped,
}

enum Event<T> {
    Item(T),
    Closed,
    Stop,
}

#[derive(Debug)]
pub struct WorkQueue<T> {
    receiver: async_channel::Receiver<T>,
    stop: CancellationToken,
    state: WorkerState,
}

impl<T> WorkQueue<T> {
    pub fn new(receiver: async_channel::Receiver<T>, stop: CancellationToken) -> Self {
        Self {
            receiver,
            stop,
            state: WorkerState::Running,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Next item to process, or `None` once the worker reached STOPPED
    pub async fn next(&mut self) -> Option<T> {
        loop {
            match self.state {
                WorkerState::Running => {
                    let event = tokio::select! {
                        // prefer queued work over the stop signal
                        biased;
                        item = self.receiver.recv() => match item {
                            Ok(item) => Event::Item(item),
                            Err(_) => Event::Closed,
                        },
                        _ = self.stop.cancelled() => Event::Stop,
                    };
                    match event {
                        Event::Item(item) => return Some(item),
                        Event::Closed => {
                            tracing::debug!("queue closed, stopping");
                            self.state = WorkerState::Stopped;
                        }
                        Event::Stop => {
                            tracing::debug!(
                                "stop requested, draining {} queued items",
                                self.receiver.len()
                            );
                            self.state = WorkerState::Draining;
                        }
                    }
                }
                WorkerState::Draining => match self.receiver.try_recv() {
                    Ok(item) => return Some(item),
                    Err(_) => {
                        tracing::debug!("queue drained, stopping");
                        self.state = WorkerState::Stopped;
                    }
                },
                WorkerState::Stopped => return None,
            }
        }
    }
}
