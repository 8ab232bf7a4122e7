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

//! # MT/ZNP transport
//!
//! Request/response exchange with the Z-Stack application running on the
//! NCP. Only one request is in flight at a time, concurrent callers wait for
//! the previous exchange to finish.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crate::{
    link::{attach, poll_for, ByteLink},
    Result,
};

pub mod frame;
pub mod sys;

#[cfg(test)]
pub(crate) mod sim;

pub use self::frame::{fcs, Frame, FrameScanner};

/// Default time to wait for a response.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1500);

fn lock(scanner: &Mutex<FrameScanner>) -> MutexGuard<'_, FrameScanner> {
    scanner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// MT/ZNP client over a [`ByteLink`].
pub struct Znp<L> {
    link: L,
    scanner: Arc<Mutex<FrameScanner>>,
    request: tokio::sync::Mutex<()>,
}

impl<L> Znp<L>
where
    L: ByteLink,
{
    pub fn new(link: L) -> Self {
        let scanner = Arc::new(Mutex::new(FrameScanner::new()));
        attach(&link, &scanner);

        Znp {
            link,
            scanner,
            request: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the underlying link.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Send a frame and wait up to `timeout` for the first valid frame
    /// received after it.
    ///
    /// The receive buffer is cleared before sending, a late response to an
    /// earlier request that timed out is never returned here.
    ///
    /// Returns `Ok(None)` on timeout. Fails only if the frame can't be
    /// encoded or the link rejects the write.
    pub async fn send_and_wait(
        &self,
        cmd0: u8,
        cmd1: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Option<Frame>> {
        let frame = Frame::new(cmd0, cmd1, payload).encode()?;

        let _request = self.request.lock().await;

        lock(&self.scanner).clear();
        log::trace!("MT tx {:02X} {:02X} {:?}", cmd0, cmd1, payload);
        self.link.write(&frame).await?;

        let response =
            poll_for(timeout, || lock(&self.scanner).try_extract_frame()).await;
        if response.is_none() {
            log::debug!(
                "no MT response to {:02X} {:02X} after {:?}",
                cmd0,
                cmd1,
                timeout
            );
        }

        Ok(response)
    }
}

#[cfg(test)]
mod test {
    use tokio::time::Instant;

    use super::*;
    use crate::{link::mock::MockLink, Error};

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_none() {
        let znp = Znp::new(MockLink::new());
        let timeout = Duration::from_millis(1500);

        let start = Instant::now();
        let r = znp.send_and_wait(0x21, 0x01, &[], timeout).await.unwrap();
        assert!(r.is_none());
        let elapsed = start.elapsed();
        assert!(elapsed >= timeout && elapsed < timeout + Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_response() {
        let link = MockLink::with_responder(|data| {
            assert_eq!(data, [0xFE, 0x00, 0x21, 0x01, 0x20]);
            let reply = Frame::new(0x61, 0x01, &[0x79, 0x01]).encode().unwrap();
            // Noise, then the frame split in two.
            vec![vec![0x00, 0x12], reply[..2].to_vec(), reply[2..].to_vec()]
        });
        let znp = Znp::new(link);

        let r = znp.send_and_wait(0x21, 0x01, &[], DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(r, Some(Frame::new(0x61, 0x01, &[0x79, 0x01])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_response_is_dropped() {
        let link = Arc::new(MockLink::with_responder(|data| {
            if data[3] == 0x02 {
                vec![Frame::new(0x61, 0x02, &[0x02]).encode().unwrap()]
            } else {
                Vec::new()
            }
        }));
        let znp = Znp::new(Arc::clone(&link));

        let r = znp
            .send_and_wait(0x21, 0x01, &[], Duration::from_millis(100))
            .await
            .unwrap();
        assert!(r.is_none());

        // The answer to the first request shows up late.
        link.inject(&Frame::new(0x61, 0x01, &[0x79, 0x01]).encode().unwrap());

        let r = znp
            .send_and_wait(0x21, 0x02, &[], Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(r, Some(Frame::new(0x61, 0x02, &[0x02])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_wait() {
        let link = Arc::new(MockLink::with_responder(|data| {
            if data[3] == 0x02 {
                vec![Frame::new(0x61, 0x02, &[]).encode().unwrap()]
            } else {
                Vec::new()
            }
        }));
        let znp = Znp::new(Arc::clone(&link));
        let timeout = Duration::from_millis(100);

        let start = Instant::now();
        let (first, second) = tokio::join!(
            znp.send_and_wait(0x21, 0x01, &[], timeout),
            znp.send_and_wait(0x21, 0x02, &[], timeout),
        );

        assert!(first.unwrap().is_none());
        assert_eq!(second.unwrap().map(|f| f.cmd1), Some(0x02));
        // The second request was only sent after the first one timed out.
        assert!(start.elapsed() >= timeout);
        let order: Vec<u8> = link.writes().iter().map(|w| w[3]).collect();
        assert_eq!(order, vec![0x01, 0x02]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_is_error() {
        let link = MockLink::new();
        link.close();
        let znp = Znp::new(link);

        let r = znp.send_and_wait(0x21, 0x01, &[], DEFAULT_TIMEOUT).await;
        assert!(matches!(r, Err(Error::NotConnected)));
    }
}
