// Copyright 2021 Locha Mesh Developers <contact@locha.io>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Byte links
//!
//! A byte link is a duplex byte channel to the NCP. It has no framing
//! guarantee: inbound bytes may arrive split or coalesced in any way, but
//! always in order.
//!
//! Two concrete links are provided:
//!
//! - [`serial::SerialLink`], a local serial port.
//! - [`relay::RelayLink`], a remote serial port reached through a WebSocket
//! to TCP bridge.

use std::{
    io,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::Instant;

pub mod relay;
pub mod serial;

#[cfg(test)]
pub(crate) mod mock;

/// Consumer of inbound bytes.
pub type DataCallback = Box<dyn Fn(&[u8]) + Send + Sync + 'static>;

/// Interval used when polling a receive buffer.
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Abstraction of the byte channel to the device.
#[async_trait]
pub trait ByteLink: Send + Sync {
    /// Write `data`, completes when the bytes are accepted by the
    /// underlying transport.
    async fn write(&self, data: &[u8]) -> io::Result<()>;

    /// Register a consumer for inbound bytes.
    ///
    /// Registration is additive, every registered consumer receives all
    /// bytes.
    fn on_data(&self, callback: DataCallback);
}

#[async_trait]
impl<L> ByteLink for Arc<L>
where
    L: ByteLink + ?Sized,
{
    async fn write(&self, data: &[u8]) -> io::Result<()> {
        (**self).write(data).await
    }

    fn on_data(&self, callback: DataCallback) {
        (**self).on_data(callback)
    }
}

/// Receive state fed from a link callback.
pub trait Feed: Send + 'static {
    fn feed(&mut self, data: &[u8]);
}

/// Attach `sink` to the link.
///
/// The callback only keeps a weak reference, once the owner of `sink` is
/// dropped the callback ignores all data.
pub(crate) fn attach<L, F>(link: &L, sink: &Arc<Mutex<F>>)
where
    L: ByteLink + ?Sized,
    F: Feed,
{
    let weak: Weak<Mutex<F>> = Arc::downgrade(sink);
    link.on_data(Box::new(move |data| {
        if let Some(sink) = weak.upgrade() {
            if let Ok(mut sink) = sink.lock() {
                sink.feed(data);
            }
        }
    }));
}

/// Poll `f` every [`POLL_INTERVAL`] until it yields a value or `timeout`
/// elapses.
pub(crate) async fn poll_for<T, F>(timeout: Duration, mut f: F) -> Option<T>
where
    F: FnMut() -> Option<T>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(v) = f() {
            return Some(v);
        }

        let now = Instant::now();
        if now >= deadline {
            return None;
        }

        tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
    }
}

/// Dispatch `data` to every registered callback, in registration order.
pub(crate) fn dispatch(callbacks: &Mutex<Vec<DataCallback>>, data: &[u8]) {
    if data.is_empty() {
        return;
    }

    match callbacks.lock() {
        Ok(callbacks) => {
            for cb in callbacks.iter() {
                cb(data);
            }
        }
        Err(_) => log::warn!("callback list poisoned, dropping {} bytes", data.len()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct Collect(Vec<u8>);

    impl Feed for Collect {
        fn feed(&mut self, data: &[u8]) {
            self.0.extend_from_slice(data);
        }
    }

    #[test]
    fn test_attach_stops_after_drop() {
        let link = mock::MockLink::new();
        let sink = Arc::new(Mutex::new(Collect::default()));
        attach(&link, &sink);

        link.inject(&[1, 2]);
        link.inject(&[3]);
        assert_eq!(sink.lock().unwrap().0, vec![1, 2, 3]);

        drop(sink);
        // Must not panic nor keep the data anywhere.
        link.inject(&[4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_for_times_out() {
        let start = Instant::now();
        let r: Option<()> = poll_for(Duration::from_millis(100), || None).await;
        assert!(r.is_none());
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }
}
