//! Scripted in-memory link used by the unit tests.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;

use super::{dispatch, ByteLink, DataCallback};

type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// A link that records every write and answers through a responder.
///
/// The responder sees each written buffer and returns the chunks to deliver
/// back, which are dispatched before `write` completes.
pub(crate) struct MockLink {
    callbacks: Mutex<Vec<DataCallback>>,
    writes: Mutex<Vec<Vec<u8>>>,
    responder: Mutex<Option<Responder>>,
    closed: AtomicBool,
}

impl MockLink {
    pub fn new() -> Self {
        MockLink {
            callbacks: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_responder<R>(responder: R) -> Self
    where
        R: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        let link = Self::new();
        *link.responder.lock().unwrap() = Some(Box::new(responder));
        link
    }

    /// Deliver inbound bytes to the registered consumers.
    pub fn inject(&self, data: &[u8]) {
        dispatch(&self.callbacks, data);
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ByteLink for MockLink {
    async fn write(&self, data: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "mock link closed",
            ));
        }

        self.writes.lock().unwrap().push(data.to_vec());

        let replies = match self.responder.lock().unwrap().as_mut() {
            Some(responder) => responder(data),
            None => Vec::new(),
        };
        for reply in replies {
            self.inject(&reply);
        }

        Ok(())
    }

    fn on_data(&self, callback: DataCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }
}
