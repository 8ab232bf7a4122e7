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

//! Serial over TCP, tunnelled through a WebSocket bridge.
//!
//! The bridge accepts `ws://<bridge>/connect?host=<host>&port=<port>`, opens
//! a raw TCP socket to `host:port` and pipes bytes in both directions as
//! binary WebSocket messages.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use reqwest::Url;
use tokio::{net::TcpStream, task::JoinHandle};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

use super::{dispatch, ByteLink, DataCallback};
use crate::{Error, Result};

type WsSink =
    SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Remote serial port reached through the WebSocket bridge.
pub struct RelayLink {
    sink: tokio::sync::Mutex<WsSink>,
    callbacks: Arc<Mutex<Vec<DataCallback>>>,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl RelayLink {
    /// Build the bridge URL for the TCP endpoint `host:port`.
    pub fn url(ws_base: &str, host: &str, port: u16) -> Result<Url> {
        let base = if ws_base.starts_with("ws://") || ws_base.starts_with("wss://") {
            ws_base.to_owned()
        } else {
            format!("ws://{}", ws_base)
        };

        Url::parse_with_params(
            &format!("{}/connect", base.trim_end_matches('/')),
            &[("host", host), ("port", &port.to_string())],
        )
        .map_err(|e| Error::InvalidUrl(format!("{}: {}", base, e)))
    }

    /// Connect to the bridge at `ws_base` and ask it to open `host:port`.
    pub async fn connect(ws_base: &str, host: &str, port: u16) -> Result<Self> {
        let url = Self::url(ws_base, host, port)?;
        log::info!("Connecting to relay {}", url);

        let (ws, _) = connect_async(url.as_str()).await?;
        let (sink, mut stream) = ws.split();

        let callbacks: Arc<Mutex<Vec<DataCallback>>> = Arc::default();
        let open = Arc::new(AtomicBool::new(true));

        let reader = {
            let callbacks = Arc::clone(&callbacks);
            let open = Arc::clone(&open);
            tokio::spawn(async move {
                while let Some(msg) = stream.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => {
                            log::trace!("relay rx {:?}", data);
                            dispatch(&callbacks, &data);
                        }
                        Ok(Message::Close(frame)) => {
                            log::debug!("relay closed by bridge: {:?}", frame);
                            break;
                        }
                        Ok(_) => (),
                        Err(e) => {
                            log::warn!("relay receive failed: {}", e);
                            break;
                        }
                    }
                }
                open.store(false, Ordering::SeqCst);
            })
        };

        Ok(RelayLink {
            sink: tokio::sync::Mutex::new(sink),
            callbacks,
            open,
            reader,
        })
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Close the WebSocket, further writes fail.
    pub async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            log::debug!("relay close: {}", e);
        }
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl ByteLink for RelayLink {
    async fn write(&self, data: &[u8]) -> io::Result<()> {
        if !self.is_open() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "tcp not connected",
            ));
        }

        if data.is_empty() {
            return Ok(());
        }

        log::trace!("relay tx {:?}", data);
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))
    }

    fn on_data(&self, callback: DataCallback) {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.push(callback);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bridge_url() {
        let url = RelayLink::url("127.0.0.1:8765", "192.168.1.100", 6638).unwrap();
        assert_eq!(
            url.as_str(),
            "ws://127.0.0.1:8765/connect?host=192.168.1.100&port=6638"
        );

        let url = RelayLink::url("ws://bridge.local:8765/", "zb gw", 6638).unwrap();
        assert_eq!(
            url.as_str(),
            "ws://bridge.local:8765/connect?host=zb+gw&port=6638"
        );
    }
}
