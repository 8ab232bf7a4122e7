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

use std::{fmt, io};

use thiserror::Error;

use crate::util::status_code_to_str;

pub type Result<T> = std::result::Result<T, Error>;

/// Bootloader operation that requires a status confirmation.
///
/// Used to tell apart which phase of a multi-command operation failed.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Operation {
    ChipId,
    Erase,
    SectorErase,
    BankErase,
    DownloadHeader,
    SendData,
    Crc32,
    MemoryRead,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::ChipId => "chip id",
            Operation::Erase => "erase",
            Operation::SectorErase => "sector erase",
            Operation::BankErase => "bank erase",
            Operation::DownloadHeader => "download header",
            Operation::SendData => "send data",
            Operation::Crc32 => "crc32",
            Operation::MemoryRead => "memory read",
        };

        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no active connection")]
    NotConnected,
    #[error("I/O error: {0}")]
    Io(io::Error),
    #[error("no ACK on sync")]
    NoSyncAck,
    #[error("timeout waiting for ACK/NACK to command {0:#04X}")]
    AckTimeout(u8),
    #[error("command {0:#04X} not acknowledged")]
    Nack(u8),
    #[error("timeout receiving packet")]
    PacketTimeout,
    #[error("invalid packet size {0}")]
    InvalidPacket(u8),
    #[error("packet checksum error (expected {expected:#04X}, found {found:#04X})")]
    Checksum { expected: u8, found: u8 },
    #[error("{operation} failed: {}", describe_status(.status))]
    Status {
        operation: Operation,
        status: Option<u8>,
    },
    #[error("{operation} response too short, expected {expected} bytes, found {found}")]
    ShortResponse {
        operation: Operation,
        expected: usize,
        found: usize,
    },
    #[error("payload of {0} bytes does not fit in a single frame")]
    PayloadTooLarge(usize),
    #[error("invalid URL {0}")]
    InvalidUrl(String),
    #[error("HTTP control request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("WebSocket relay error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("control lines: {0}")]
    Control(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotConnected {
            Error::NotConnected
        } else {
            Error::Io(e)
        }
    }
}

fn describe_status(status: &Option<u8>) -> String {
    match *status {
        Some(ret) => format!("`{}` ({:#X})", status_code_to_str(ret), ret),
        None => "no status received".to_owned(),
    }
}
