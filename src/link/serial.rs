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

//! Local serial port link.

use std::{
    ffi::OsStr,
    io::{self, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use ::serial::SerialPort;
use async_trait::async_trait;

use super::{dispatch, ByteLink, DataCallback};
use crate::{control::ControlLines, Error, Result};

/// Read timeout of the receive thread, bounds how long a write or a
/// control-line change may wait for the port.
const RX_POLL_TIMEOUT: Duration = Duration::from_millis(10);

struct Shared<P> {
    port: Mutex<P>,
    callbacks: Mutex<Vec<DataCallback>>,
    closed: AtomicBool,
}

impl<P> Shared<P> {
    fn with_port<F, T>(&self, f: F) -> io::Result<T>
    where
        F: FnOnce(&mut P) -> io::Result<T>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "serial port closed",
            ));
        }

        let mut port = self.port.lock().map_err(|_| {
            io::Error::new(io::ErrorKind::Other, "serial port lock poisoned")
        })?;
        f(&mut *port)
    }
}

/// A serial port driven as a [`ByteLink`].
///
/// A background thread reads the port and dispatches inbound bytes to the
/// registered consumers. The DTR and RTS lines are exposed through
/// [`ControlLines`].
pub struct SerialLink<P> {
    shared: Arc<Shared<P>>,
}

impl SerialLink<::serial::SystemPort> {
    /// Open and configure the serial port at `path`.
    pub fn open<T>(path: &T, baud_rate: usize) -> io::Result<Self>
    where
        T: AsRef<OsStr> + ?Sized,
    {
        let mut port = ::serial::open(path)?;

        let mut settings = crate::port_settings();
        settings.baud_rate = ::serial::BaudRate::from_speed(baud_rate);
        port.configure(&settings)?;

        SerialLink::new(port)
    }
}

impl<P> SerialLink<P>
where
    P: SerialPort + Send + 'static,
{
    /// Take an already configured port and start the receive thread.
    pub fn new(mut port: P) -> io::Result<Self> {
        port.set_timeout(RX_POLL_TIMEOUT)?;

        let shared = Arc::new(Shared {
            port: Mutex::new(port),
            callbacks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&shared);
        thread::Builder::new()
            .name("serial-rx".into())
            .spawn(move || {
                let mut buf = [0u8; 256];
                while let Some(shared) = weak.upgrade() {
                    if shared.closed.load(Ordering::SeqCst) {
                        break;
                    }

                    let n = match shared.port.lock() {
                        Ok(mut port) => match port.read(&mut buf) {
                            Ok(n) => n,
                            Err(e) if e.kind() == io::ErrorKind::TimedOut => 0,
                            Err(e) => {
                                log::error!("serial read failed: {}", e);
                                shared.closed.store(true, Ordering::SeqCst);
                                break;
                            }
                        },
                        Err(_) => break,
                    };

                    if n > 0 {
                        log::trace!("serial rx {:?}", &buf[..n]);
                        dispatch(&shared.callbacks, &buf[..n]);
                    }
                }
                log::debug!("serial receive thread finished");
            })?;

        Ok(SerialLink { shared })
    }

    /// Stop the receive thread, further writes fail with
    /// [`io::ErrorKind::NotConnected`].
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

impl<P> Drop for SerialLink<P> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl<P> ByteLink for SerialLink<P>
where
    P: SerialPort + Send + 'static,
{
    async fn write(&self, data: &[u8]) -> io::Result<()> {
        log::trace!("serial tx {:?}", data);
        let data = data.to_vec();
        let shared = Arc::clone(&self.shared);

        tokio::task::spawn_blocking(move || {
            shared.with_port(|port| {
                port.write_all(&data)?;
                port.flush()
            })
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    fn on_data(&self, callback: DataCallback) {
        if let Ok(mut callbacks) = self.shared.callbacks.lock() {
            callbacks.push(callback);
        }
    }
}

#[async_trait]
impl<P> ControlLines for SerialLink<P>
where
    P: SerialPort + Send + 'static,
{
    /// DTR drives !RESET and RTS drives the bootloader pin, both active low.
    async fn set_lines(&self, rst_low: bool, bsl_low: bool) -> Result<()> {
        let (dtr, rts) = (!rst_low, !bsl_low);
        log::debug!(
            "CTRL(serial): DTR={} RTS={}",
            u8::from(dtr),
            u8::from(rts)
        );

        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || {
            shared.with_port(|port| {
                port.set_dtr(dtr)?;
                port.set_rts(rts)?;
                Ok(())
            })
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
        .map_err(Error::from)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Port with no data, recording the control lines.
    #[derive(Default)]
    struct FakePort {
        lines: Arc<Mutex<Option<(bool, bool)>>>,
        timeout: Duration,
    }

    impl Read for FakePort {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_millis(1));
            Err(io::ErrorKind::TimedOut.into())
        }
    }

    impl Write for FakePort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SerialPort for FakePort {
        fn timeout(&self) -> Duration {
            self.timeout
        }

        fn set_timeout(&mut self, timeout: Duration) -> ::serial::Result<()> {
            self.timeout = timeout;
            Ok(())
        }

        fn configure(&mut self, _settings: &::serial::PortSettings) -> ::serial::Result<()> {
            Ok(())
        }

        fn reconfigure(
            &mut self,
            _setup: &dyn Fn(&mut dyn ::serial::SerialPortSettings) -> ::serial::Result<()>,
        ) -> ::serial::Result<()> {
            Ok(())
        }

        fn set_rts(&mut self, level: bool) -> ::serial::Result<()> {
            let mut lines = self.lines.lock().unwrap();
            let dtr = lines.map_or(true, |(dtr, _)| dtr);
            *lines = Some((dtr, level));
            Ok(())
        }

        fn set_dtr(&mut self, level: bool) -> ::serial::Result<()> {
            let mut lines = self.lines.lock().unwrap();
            let rts = lines.map_or(true, |(_, rts)| rts);
            *lines = Some((level, rts));
            Ok(())
        }

        fn read_cts(&mut self) -> ::serial::Result<bool> {
            Ok(false)
        }

        fn read_dsr(&mut self) -> ::serial::Result<bool> {
            Ok(false)
        }

        fn read_ri(&mut self) -> ::serial::Result<bool> {
            Ok(false)
        }

        fn read_cd(&mut self) -> ::serial::Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_set_lines_levels() {
        let port = FakePort::default();
        let lines = Arc::clone(&port.lines);
        let link = SerialLink::new(port).unwrap();

        link.set_lines(true, false).await.unwrap();
        assert_eq!(*lines.lock().unwrap(), Some((false, true)));

        link.set_lines(false, true).await.unwrap();
        assert_eq!(*lines.lock().unwrap(), Some((true, false)));

        link.close();
        assert!(matches!(link.set_lines(true, true).await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_set_lines_waits_off_the_runtime() {
        let link = Arc::new(SerialLink::new(FakePort::default()).unwrap());

        // Single threaded runtime: a blocking wait on the port would never
        // let this task release it.
        let port = link.shared.port.lock().unwrap();
        let task = {
            let link = Arc::clone(&link);
            tokio::spawn(async move { link.set_lines(true, true).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        drop(port);

        task.await.unwrap().unwrap();
    }
}
