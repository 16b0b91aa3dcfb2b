//! Runs a [`RenderSession`] on a dedicated thread and forwards its events
//! over a bounded channel.

use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread::{self, JoinHandle};

use tracing::warn;

use crate::stroke_engine::{CancelToken, RenderError, RenderEvent, RenderRequest, RenderSession};

const EVENT_QUEUE_DEPTH: usize = 4;

pub struct RenderHandle {
    receiver: Receiver<RenderEvent>,
    cancel: CancelToken,
    worker: Option<JoinHandle<Result<(), RenderError>>>,
    finished: bool,
    disconnected: bool,
}

/// Checks mask sizes on the calling thread; preparation and every chunk run
/// on the worker. A preparation failure closes the queue without a terminal
/// event and is returned from [`RenderHandle::join`].
pub fn spawn_render(request: RenderRequest) -> Result<RenderHandle, RenderError> {
    request.check_dimensions()?;
    let cancel = CancelToken::new();
    let token = cancel.clone();
    let (sender, receiver) = mpsc::sync_channel::<RenderEvent>(EVENT_QUEUE_DEPTH);

    let worker = thread::Builder::new()
        .name("typewriter-render".to_owned())
        .spawn(move || {
            let session = RenderSession::prepare(request, token).map_err(|error| {
                warn!(%error, "render preparation failed");
                error
            })?;
            for event in session {
                if sender.send(event).is_err() {
                    warn!("render observer dropped; abandoning session");
                    break;
                }
            }
            Ok(())
        })
        .map_err(|error| RenderError::WorkerSpawn(error.to_string()))?;

    Ok(RenderHandle {
        receiver,
        cancel,
        worker: Some(worker),
        finished: false,
        disconnected: false,
    })
}

impl RenderHandle {
    /// Requests a stop; acknowledged at the next chunk boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Blocks for the next event; `None` after the terminal event.
    pub fn recv(&mut self) -> Option<RenderEvent> {
        if self.finished {
            return None;
        }
        match self.receiver.recv() {
            Ok(event) => {
                self.finished = event.is_terminal();
                Some(event)
            }
            Err(_) => {
                self.disconnected = true;
                None
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<RenderEvent> {
        if self.finished {
            return None;
        }
        match self.receiver.try_recv() {
            Ok(event) => {
                self.finished = event.is_terminal();
                Some(event)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.disconnected = true;
                None
            }
        }
    }

    /// The worker exited without sending a terminal event; `join` reports why.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn join(mut self) -> Result<(), RenderError> {
        // Unblock a worker waiting on a full queue.
        while self.recv().is_some() {}
        let handle = self.worker.take().ok_or(RenderError::WorkerPanicked)?;
        handle.join().map_err(|_| RenderError::WorkerPanicked)?
    }
}

impl Iterator for RenderHandle {
    type Item = RenderEvent;

    fn next(&mut self) -> Option<RenderEvent> {
        self.recv()
    }
}
