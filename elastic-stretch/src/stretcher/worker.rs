//! One processing thread per channel for threaded offline runs

use crate::channel::{ChannelData, ChunkParams};
use crate::StretchError;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use ringbuf::traits::Observer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Cooperative stop request checked after every wake-up
#[derive(Debug, Clone, Default)]
pub(crate) struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub(crate) struct Worker {
    channel: usize,
    data_tx: Sender<()>,
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start processing `data` on its own thread.
    ///
    /// The worker signals `space_tx` whenever it has freed input space.
    pub fn spawn(
        channel: usize,
        data: Arc<Mutex<ChannelData>>,
        params: Arc<ChunkParams>,
        space_tx: Sender<()>,
    ) -> Result<Self, StretchError> {
        let (data_tx, data_rx) = bounded(1);
        let cancel = CancelToken::default();
        let token = cancel.clone();

        let handle = thread::Builder::new()
            .name(format!("stretch-{}", channel))
            .spawn(move || run(channel, data, params, data_rx, space_tx, token))?;

        tracing::info!("Started worker for channel {}", channel);
        Ok(Self {
            channel,
            data_tx,
            cancel,
            handle: Some(handle),
        })
    }

    /// Wake the worker after new input has been written
    pub fn signal_data_available(&self) {
        let _ = self.data_tx.try_send(());
    }

    /// Ask the worker to stop at its next wake-up, and wake it
    pub fn abandon(&self) {
        self.cancel.cancel();
        self.signal_data_available();
    }

    pub fn join(mut self) {
        self.join_inner();
    }

    fn join_inner(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Worker for channel {} panicked", self.channel);
            } else {
                tracing::debug!("Joined worker for channel {}", self.channel);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.abandon();
            self.join_inner();
        }
    }
}

fn run(
    channel: usize,
    data: Arc<Mutex<ChannelData>>,
    params: Arc<ChunkParams>,
    data_rx: Receiver<()>,
    space_tx: Sender<()>,
    cancel: CancelToken,
) {
    tracing::debug!("Worker {} running", channel);

    loop {
        let (progress, ready) = {
            let mut d = data.lock();
            let shared = d.shared();
            let input_done = shared.input_size().is_some() && d.inbuf.occupied_len() == 0;
            if input_done || shared.output_complete() {
                break;
            }
            let progress = d.process_chunks(&params);
            let ready = !progress.last && d.test_inbuf_read_space(&params);
            (progress, ready)
        };

        if progress.last {
            break;
        }
        if progress.any {
            let _ = space_tx.try_send(());
        }

        if !ready && !cancel.is_cancelled() {
            // A closed channel means the stretcher is going away
            if data_rx.recv().is_err() {
                return;
            }
        }

        if cancel.is_cancelled() {
            tracing::debug!("Worker {} abandoning", channel);
            return;
        }
    }

    data.lock().process_chunks(&params);
    let _ = space_tx.try_send(());
    tracing::debug!("Worker {} done", channel);
}
