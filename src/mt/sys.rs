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

//! MT SYS subsystem commands.
//!
//! Every command is a synchronous request (`SREQ`) answered by a
//! synchronous response (`SRSP`) with the same command ID. A response with
//! any other header, or no response at all, is reported as "no response"
//! (`None` or `false`), never as an error. All integers are little-endian.

use std::{fmt, time::Duration};

use super::Znp;
use crate::{link::ByteLink, Result};

/// SYS synchronous request.
pub const SYS_SREQ: u8 = 0x21;
/// SYS synchronous response.
pub const SYS_SRSP: u8 = 0x61;

pub const SYS_PING: u8 = 0x01;
pub const SYS_VERSION: u8 = 0x02;
pub const SYS_OSAL_NV_ITEM_INIT: u8 = 0x07;
pub const SYS_OSAL_NV_WRITE: u8 = 0x09;
pub const SYS_OSAL_NV_DELETE: u8 = 0x12;
pub const SYS_OSAL_NV_LENGTH: u8 = 0x13;
pub const SYS_OSAL_NV_READ_EXT: u8 = 0x1C;
pub const SYS_NV_CREATE: u8 = 0x30;
pub const SYS_NV_DELETE: u8 = 0x31;
pub const SYS_NV_LENGTH: u8 = 0x32;
pub const SYS_NV_READ: u8 = 0x33;
pub const SYS_NV_WRITE: u8 = 0x34;

/// Z-Stack system ID of the extended NV items.
pub const NV_SYS_ID_ZSTACK: u8 = 0x01;

pub const STATUS_SUCCESS: u8 = 0x00;
/// `osal_nv_item_init` created the item.
pub const STATUS_NV_ITEM_UNINIT: u8 = 0x09;
/// `NV_CREATE` found the item already there.
pub const STATUS_NV_ITEM_EXISTS: u8 = 0x0A;

/// Largest value slice carried by one extended NV read or write.
pub const NV_CHUNK: usize = 244;
/// Largest value slice carried by one legacy NV write.
pub const OSAL_NV_WRITE_CHUNK: usize = 240;

const PING_TIMEOUT: Duration = Duration::from_millis(3000);
const VERSION_TIMEOUT: Duration = Duration::from_millis(3000);
const LENGTH_TIMEOUT: Duration = Duration::from_millis(1500);
const READ_TIMEOUT: Duration = Duration::from_millis(2000);
const ITEM_INIT_TIMEOUT: Duration = Duration::from_millis(2000);
const OSAL_WRITE_TIMEOUT: Duration = Duration::from_millis(4000);
const DELETE_TIMEOUT: Duration = Duration::from_millis(2000);
const NV_CREATE_TIMEOUT: Duration = Duration::from_millis(2000);
const NV_WRITE_TIMEOUT: Duration = Duration::from_millis(3000);

/// Response to `SYS_VERSION`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Version {
    pub transport: u8,
    pub product: u8,
    pub major: u8,
    pub minor: u8,
    pub maint: u8,
    pub revision: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{} (product {}, transport {}, revision {})",
            self.major, self.minor, self.maint, self.product, self.transport, self.revision
        )
    }
}

fn extended_key(table: u16, sub_id: u16) -> Vec<u8> {
    let mut payload = Vec::with_capacity(5);
    payload.push(NV_SYS_ID_ZSTACK);
    payload.extend_from_slice(&table.to_le_bytes());
    payload.extend_from_slice(&sub_id.to_le_bytes());
    payload
}

/// `status, len, value[len]` read response, the value is clamped to the
/// bytes actually received.
fn read_response(payload: &[u8]) -> Option<&[u8]> {
    match payload {
        [STATUS_SUCCESS, len, value @ ..] => {
            Some(&value[..usize::from(*len).min(value.len())])
        }
        _ => None,
    }
}

fn is_success(payload: &[u8]) -> bool {
    payload.first() == Some(&STATUS_SUCCESS)
}

impl<L> Znp<L>
where
    L: ByteLink,
{
    /// Send a SYS request and return the payload of its SRSP.
    async fn sys(
        &self,
        cmd1: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        let response = match self.send_and_wait(SYS_SREQ, cmd1, payload, timeout).await? {
            Some(response) => response,
            None => return Ok(None),
        };

        if response.cmd0 != SYS_SRSP || response.cmd1 != cmd1 {
            log::debug!(
                "unexpected response {:?} to SYS {:#04X}",
                response,
                cmd1
            );
            return Ok(None);
        }

        Ok(Some(response.payload))
    }

    /// Check the application answers.
    pub async fn ping(&self) -> Result<bool> {
        Ok(self.sys(SYS_PING, &[], PING_TIMEOUT).await?.is_some())
    }

    /// Read the firmware version.
    pub async fn version(&self) -> Result<Option<Version>> {
        let p = match self.sys(SYS_VERSION, &[], VERSION_TIMEOUT).await? {
            Some(p) if p.len() >= 9 => p,
            _ => return Ok(None),
        };

        Ok(Some(Version {
            transport: p[0],
            product: p[1],
            major: p[2],
            minor: p[3],
            maint: p[4],
            revision: u32::from_le_bytes([p[5], p[6], p[7], p[8]]),
        }))
    }

    /// Length of a legacy NV item, `Some(0)` if it doesn't exist.
    pub async fn osal_nv_length(&self, id: u16) -> Result<Option<u16>> {
        let p = self
            .sys(SYS_OSAL_NV_LENGTH, &id.to_le_bytes(), LENGTH_TIMEOUT)
            .await?;

        Ok(p.filter(|p| p.len() >= 2)
            .map(|p| u16::from_le_bytes([p[0], p[1]])))
    }

    /// Read up to `len` bytes of a legacy NV item.
    ///
    /// Reading stops early on a failed or empty page, the bytes read so far
    /// are returned.
    pub async fn osal_nv_read(&self, id: u16, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);

        while out.len() < len {
            let mut request = id.to_le_bytes().to_vec();
            request.extend_from_slice(&(out.len() as u16).to_le_bytes());

            let p = self
                .sys(SYS_OSAL_NV_READ_EXT, &request, READ_TIMEOUT)
                .await?;
            match p.as_deref().and_then(read_response) {
                Some(chunk) if !chunk.is_empty() => out.extend_from_slice(chunk),
                _ => break,
            }
        }

        out.truncate(len);
        Ok(out)
    }

    /// Create a legacy NV item of `len` bytes if it doesn't exist.
    pub async fn osal_nv_item_init(&self, id: u16, len: u16) -> Result<bool> {
        let mut request = Vec::with_capacity(5);
        request.extend_from_slice(&id.to_le_bytes());
        request.extend_from_slice(&len.to_le_bytes());
        // No initial data.
        request.push(0);

        let p = self
            .sys(SYS_OSAL_NV_ITEM_INIT, &request, ITEM_INIT_TIMEOUT)
            .await?;

        Ok(matches!(
            p.as_deref().and_then(|p| p.first()),
            Some(&STATUS_SUCCESS) | Some(&STATUS_NV_ITEM_UNINIT)
        ))
    }

    /// Write `value` at `offset` of a legacy NV item.
    pub async fn osal_nv_write(&self, id: u16, offset: u16, value: &[u8]) -> Result<bool> {
        let mut request = Vec::with_capacity(5 + value.len());
        request.extend_from_slice(&id.to_le_bytes());
        request.extend_from_slice(&offset.to_le_bytes());
        request.push(value.len() as u8);
        request.extend_from_slice(value);

        let p = self
            .sys(SYS_OSAL_NV_WRITE, &request, OSAL_WRITE_TIMEOUT)
            .await?;

        Ok(p.map_or(false, |p| is_success(&p)))
    }

    /// Delete a legacy NV item of `len` bytes.
    pub async fn osal_nv_delete(&self, id: u16, len: u16) -> Result<bool> {
        let mut request = Vec::with_capacity(4);
        request.extend_from_slice(&id.to_le_bytes());
        request.extend_from_slice(&len.to_le_bytes());

        let p = self
            .sys(SYS_OSAL_NV_DELETE, &request, DELETE_TIMEOUT)
            .await?;

        Ok(p.map_or(false, |p| is_success(&p)))
    }

    /// Length of an extended NV item, `Some(0)` if it doesn't exist and
    /// `None` if extended NV isn't supported.
    pub async fn nv_length(&self, table: u16, sub_id: u16) -> Result<Option<u32>> {
        let p = self
            .sys(SYS_NV_LENGTH, &extended_key(table, sub_id), LENGTH_TIMEOUT)
            .await?;

        Ok(p.filter(|p| p.len() >= 4)
            .map(|p| u32::from_le_bytes([p[0], p[1], p[2], p[3]])))
    }

    /// Read `len` bytes of an extended NV item, in pages of [`NV_CHUNK`]
    /// bytes. `None` if any page fails.
    pub async fn nv_read(
        &self,
        table: u16,
        sub_id: u16,
        len: usize,
    ) -> Result<Option<Vec<u8>>> {
        let mut out = Vec::with_capacity(len);

        while out.len() < len {
            let count = NV_CHUNK.min(len - out.len());
            let mut request = extended_key(table, sub_id);
            request.extend_from_slice(&(out.len() as u16).to_le_bytes());
            request.push(count as u8);

            let p = self.sys(SYS_NV_READ, &request, READ_TIMEOUT).await?;
            match p.as_deref().map(read_response) {
                Some(Some(chunk)) if chunk.is_empty() => break,
                Some(Some(chunk)) => out.extend_from_slice(chunk),
                _ => return Ok(None),
            }
        }

        out.truncate(len);
        Ok(Some(out))
    }

    /// Create an extended NV item. An already existing item counts as
    /// success.
    pub async fn nv_create(&self, table: u16, sub_id: u16, len: u32) -> Result<bool> {
        let mut request = extended_key(table, sub_id);
        request.extend_from_slice(&len.to_le_bytes());

        let p = self
            .sys(SYS_NV_CREATE, &request, NV_CREATE_TIMEOUT)
            .await?;

        Ok(matches!(
            p.as_deref().and_then(|p| p.first()),
            Some(&STATUS_SUCCESS) | Some(&STATUS_NV_ITEM_EXISTS)
        ))
    }

    /// Delete an extended NV item.
    pub async fn nv_delete(&self, table: u16, sub_id: u16) -> Result<bool> {
        let p = self
            .sys(SYS_NV_DELETE, &extended_key(table, sub_id), LENGTH_TIMEOUT)
            .await?;

        Ok(p.map_or(false, |p| is_success(&p)))
    }

    /// Write an extended NV item, in chunks of [`NV_CHUNK`] bytes.
    pub async fn nv_write(&self, table: u16, sub_id: u16, value: &[u8]) -> Result<bool> {
        for (i, chunk) in value.chunks(NV_CHUNK).enumerate() {
            let offset = match u16::try_from(i * NV_CHUNK) {
                Ok(offset) => offset,
                Err(_) => {
                    log::debug!("NV write {:#06X}:{:#06X} past offset 0xFFFF", table, sub_id);
                    return Ok(false);
                }
            };
            let mut request = extended_key(table, sub_id);
            request.extend_from_slice(&offset.to_le_bytes());
            request.push(chunk.len() as u8);
            request.extend_from_slice(chunk);

            let p = self.sys(SYS_NV_WRITE, &request, NV_WRITE_TIMEOUT).await?;
            if !p.map_or(false, |p| is_success(&p)) {
                log::debug!(
                    "NV write {:#06X}:{:#06X} failed at offset {}",
                    table,
                    sub_id,
                    offset
                );
                return Ok(false);
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::mt::sim::{self, ZnpSim};

    fn znp(sim: ZnpSim) -> (Znp<crate::link::mock::MockLink>, Arc<Mutex<ZnpSim>>) {
        let (link, sim) = sim::link(sim);
        (Znp::new(link), sim)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_and_version() {
        let (znp, _) = znp(ZnpSim::default());
        assert!(znp.ping().await.unwrap());

        let version = znp.version().await.unwrap().unwrap();
        assert_eq!(version.product, 1);
        assert_eq!((version.major, version.minor, version.maint), (2, 7, 1));
        assert_eq!(version.revision, 20220219);
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_item() {
        let (znp, sim) = znp(ZnpSim::default());

        assert_eq!(znp.osal_nv_length(0x0021).await.unwrap(), Some(0));
        assert!(znp.osal_nv_item_init(0x0021, 300).await.unwrap());
        assert_eq!(znp.osal_nv_length(0x0021).await.unwrap(), Some(300));

        let value: Vec<u8> = (0..300).map(|i| i as u8).collect();
        assert!(znp.osal_nv_write(0x0021, 0, &value[..240]).await.unwrap());
        assert!(znp.osal_nv_write(0x0021, 240, &value[240..]).await.unwrap());
        assert_eq!(znp.osal_nv_read(0x0021, 300).await.unwrap(), value);
        assert_eq!(sim.lock().unwrap().legacy[&0x0021], value);

        assert!(znp.osal_nv_delete(0x0021, 300).await.unwrap());
        assert!(!znp.osal_nv_delete(0x0021, 300).await.unwrap());
        assert!(znp.osal_nv_read(0x0021, 300).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_osal_write_request_layout() {
        let (znp, sim) = znp(ZnpSim::default());
        znp.osal_nv_item_init(0x0003, 2).await.unwrap();
        znp.osal_nv_write(0x0003, 0, &[0xAA, 0xBB]).await.unwrap();

        let sim = sim.lock().unwrap();
        let (cmd1, payload) = sim.requests.last().unwrap();
        assert_eq!(*cmd1, SYS_OSAL_NV_WRITE);
        assert_eq!(*payload, vec![0x03, 0x00, 0x00, 0x00, 0x02, 0xAA, 0xBB]);
        assert_eq!(
            sim.requests[0].1,
            vec![0x03, 0x00, 0x02, 0x00, 0x00],
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_extended_item() {
        let (znp, _) = znp(ZnpSim::default());

        assert_eq!(znp.nv_length(0x0001, 0).await.unwrap(), Some(0));
        assert!(znp.nv_create(0x0001, 0, 500).await.unwrap());
        // Already there.
        assert!(znp.nv_create(0x0001, 0, 500).await.unwrap());

        let value: Vec<u8> = (0..500).map(|i| (i * 7) as u8).collect();
        assert!(znp.nv_write(0x0001, 0, &value).await.unwrap());
        assert_eq!(znp.nv_length(0x0001, 0).await.unwrap(), Some(500));
        assert_eq!(znp.nv_read(0x0001, 0, 500).await.unwrap(), Some(value));

        assert!(znp.nv_delete(0x0001, 0).await.unwrap());
        assert!(!znp.nv_delete(0x0001, 0).await.unwrap());
        assert!(!znp.nv_write(0x0001, 0, &[1]).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extended_unsupported() {
        let (znp, _) = znp(ZnpSim {
            extended_supported: false,
            ..Default::default()
        });

        assert_eq!(znp.nv_length(0x0001, 0).await.unwrap(), None);
        assert!(!znp.nv_create(0x0001, 0, 4).await.unwrap());
    }

    #[test]
    fn test_read_response() {
        assert_eq!(read_response(&[0x00, 0x02, 0xAA, 0xBB, 0xCC]), Some(&[0xAA, 0xBB][..]));
        assert_eq!(read_response(&[0x00, 0x05, 0xAA]), Some(&[0xAA][..]));
        assert_eq!(read_response(&[0x0A, 0x00]), None);
        assert_eq!(read_response(&[]), None);
    }
}
