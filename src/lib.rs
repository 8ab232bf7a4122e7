// Copyright 2021 Locha Mesh Developers <contact@locha.io>
//
// Based on the previous work of cc2538-bsl and Texas Instruments sblAppEx
// 1.03.00.00 (swra466c.zip).
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

//! # TI network co-processor toolkit
//!
//! A library to program and maintain Texas Instruments wireless chips used
//! as network co-processors (NCP), over a local serial port or a serial port
//! relayed through a WebSocket to TCP bridge.
//!
//! - [`Device`] talks to the ROM Serial Bootloader Interface (BSL) to
//! identify, erase, program and verify the flash.
//! - [`mt::Znp`] talks to the Z-Stack application over the MT/ZNP framed
//! protocol, [`nvram::Nvram`] uses it to back up, restore and erase the NCP
//! non-volatile memory.
//! - [`control::Sequencer`] toggles the reset and bootloader lines to move
//! the chip between the application and the bootloader.
//!
//! # Tested with the following chips
//!
//! - [CC2538](https://www.ti.com/product/CC2538)
//! - [CC2652P](https://www.ti.com/product/CC2652P)
//! - [CC1352P](https://www.ti.com/product/CC1352P)
//!
//! # See also
//!
//! - [CC2538/CC26x0/CC26x2 Serial Bootloader Interface](https://www.ti.com/lit/an/swra466c/swra466c.pdf).
//! - [Z-Stack Monitor and Test API](https://dev.ti.com/tirex/explore/node?node=AJxBMYBwH2Y7nEFRfkmM-w__pTTHBmu__LATEST).

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

#[rustfmt::skip]
pub mod constants;
pub mod chip;
pub mod control;
pub mod error;
pub mod link;
pub mod mt;
pub mod nvram;
pub mod util;

mod family;
pub use self::{
    error::{Error, Operation, Result},
    family::{Family, ParseFamilyError},
};

use self::link::{attach, poll_for, ByteLink, Feed};

/// Receive buffer of the bootloader client.
#[derive(Debug, Default)]
struct BslReceiver {
    buf: Vec<u8>,
}

impl Feed for BslReceiver {
    fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }
}

impl BslReceiver {
    fn clear(&mut self) {
        self.buf.clear();
    }

    /// Find the first ACK or NACK and consume the buffer through it.
    ///
    /// The `0x00`-prefixed forms need no special handling, the prefix is
    /// consumed along with the byte that follows it.
    fn take_ack(&mut self) -> Option<bool> {
        let (pos, ack) = self.buf.iter().enumerate().find_map(|(i, b)| match *b {
            constants::ACK => Some((i, true)),
            constants::NACK => Some((i, false)),
            _ => None,
        })?;

        log::trace!("{} found after {} bytes", if ack { "ACK" } else { "NACK" }, pos);
        self.buf.drain(..=pos);
        Some(ack)
    }

    /// Extract a `[size, checksum, payload...]` packet once it's complete.
    fn take_packet(&mut self) -> Option<Result<Vec<u8>>> {
        // [size | checksum]
        const HDR_LEN: usize = 2;

        let size = *self.buf.first()?;
        if usize::from(size) < HDR_LEN {
            self.buf.clear();
            return Some(Err(Error::InvalidPacket(size)));
        }

        let size = usize::from(size);
        if self.buf.len() < size {
            return None;
        }

        let packet: Vec<u8> = self.buf.drain(..size).collect();
        let found = packet[1];
        let payload = packet[HDR_LEN..].to_vec();
        let expected = payload_checksum(&payload);

        log::trace!(
            "response received, len = {}, cksum = {:#X}, payload = {:?}",
            size,
            found,
            payload
        );

        if expected != found {
            return Some(Err(Error::Checksum { expected, found }));
        }

        Some(Ok(payload))
    }
}

fn lock(rx: &Mutex<BslReceiver>) -> MutexGuard<'_, BslReceiver> {
    rx.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A TI connected device supporting the Serial Bootloader Interface
/// (SBL).
///
/// All commands take `&mut self`, only one command can be in flight per
/// device. Every state changing command is confirmed with
/// `COMMAND_GET_STATUS`.
pub struct Device<L> {
    link: L,
    rx: Arc<Mutex<BslReceiver>>,
}

impl<L> Device<L>
where
    L: ByteLink,
{
    /// Create a new `Device` over `link`.
    ///
    /// # Note
    ///
    /// This functions expects the device to be already in bootloader mode,
    /// use [`control::Sequencer::enter_bootloader`] on supported boards.
    /// Call [`Device::sync`] before any other command.
    pub fn new(link: L) -> Self {
        let rx = Arc::new(Mutex::new(BslReceiver::default()));
        attach(&link, &rx);

        Device { link, rx }
    }

    /// Returns the underlying link.
    pub fn link(&self) -> &L {
        &self.link
    }

    fn rx(&self) -> MutexGuard<'_, BslReceiver> {
        lock(&self.rx)
    }

    async fn write_cmd(&mut self, cmd: u8, data: &[u8]) -> Result<()> {
        // [len | checksum | cmd]
        const HDR_LEN: usize = 2;

        let content_len = 1 + data.len();
        if content_len > constants::MAX_CONTENT_LEN {
            return Err(Error::PayloadTooLarge(content_len));
        }

        let mut pkt = Vec::with_capacity(HDR_LEN + content_len);
        pkt.push((HDR_LEN + content_len) as u8);
        pkt.push(command_checksum(cmd, data));
        pkt.push(cmd);
        pkt.extend_from_slice(data);

        log::trace!("sending cmd {:#X}, pkt = {:?}", cmd, pkt);

        self.rx().clear();
        self.link.write(&pkt).await?;

        Ok(())
    }

    async fn read_ack(&mut self, cmd: u8, timeout: Duration) -> Result<()> {
        log::trace!("waiting for ACK");

        match poll_for(timeout, || lock(&self.rx).take_ack()).await {
            Some(true) => Ok(()),
            Some(false) => Err(Error::Nack(cmd)),
            None => {
                log::trace!("ACK bytes not found, timed out");
                Err(Error::AckTimeout(cmd))
            }
        }
    }

    async fn read_packet(&mut self) -> Result<Vec<u8>> {
        log::trace!("waiting for response packet");

        let payload = poll_for(constants::PACKET_TIMEOUT, || {
            lock(&self.rx).take_packet()
        })
        .await
        .ok_or(Error::PacketTimeout)??;

        self.link.write(&[0x00, constants::ACK]).await?;

        Ok(payload)
    }

    /// Write a command and wait for its acknowledgment.
    async fn command(
        &mut self,
        cmd: u8,
        data: &[u8],
        ack_timeout: Duration,
    ) -> Result<()> {
        self.write_cmd(cmd, data).await?;
        self.read_ack(cmd, ack_timeout).await
    }

    /// Write a command and wait for its acknowledgment and response packet.
    async fn query(&mut self, cmd: u8, data: &[u8]) -> Result<Vec<u8>> {
        self.command(cmd, data, constants::ACK_TIMEOUT).await?;
        self.read_packet().await
    }

    async fn check_last_cmd(&mut self, operation: Operation) -> Result<()> {
        let status = match self.get_status().await {
            Ok(status) => status,
            Err(e @ Error::NotConnected) | Err(e @ Error::Io(_)) => return Err(e),
            Err(e) => {
                log::debug!("{} status unavailable: {}", operation, e);
                None
            }
        };

        match status {
            Some(constants::COMMAND_RET_SUCCESS) => Ok(()),
            status => {
                log::debug!("{} status check failed: {:?}", operation, status);
                Err(Error::Status { operation, status })
            }
        }
    }

    /// Synchronize the baudrate with the bootloader.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSyncAck`] if the bootloader didn't acknowledge the
    /// synchronization bytes.
    pub async fn sync(&mut self) -> Result<()> {
        self.rx().clear();
        // To synchronize with the host (us) send two bytes containing 0x55. If
        // synchronization succeeds, the bootloader will return an acknowledge.
        self.link.write(&constants::SYNC).await?;

        match poll_for(constants::SYNC_TIMEOUT, || lock(&self.rx).take_ack()).await {
            Some(true) => (),
            _ => return Err(Error::NoSyncAck),
        }

        tokio::time::sleep(constants::SYNC_SETTLE).await;
        log::debug!("Auto baud finished correctly");

        Ok(())
    }

    /// Ping the bootloader.
    pub async fn ping(&mut self) -> Result<()> {
        self.command(constants::CMD_PING, &[], constants::ACK_TIMEOUT)
            .await
    }

    /// Get the status of the last issued command.
    ///
    /// Returns `None` if the bootloader answered with an empty packet.
    pub async fn get_status(&mut self) -> Result<Option<u8>> {
        let packet = self.query(constants::CMD_GET_STATUS, &[]).await?;
        Ok(packet.first().copied())
    }

    /// Read the raw chip ID packet.
    ///
    /// See [`chip::chip_id_from_packet`] to extract the 16-bit ID.
    pub async fn chip_id(&mut self) -> Result<Vec<u8>> {
        let packet = self.query(constants::CMD_GET_CHIP_ID, &[]).await?;
        self.check_last_cmd(Operation::ChipId).await?;

        Ok(packet)
    }

    /// Range erase. Only supported on [`Family::CC2538`].
    ///
    /// - See [`Family::supports_erase`].
    pub async fn erase(&mut self, address: u32, byte_count: u32) -> Result<()> {
        let mut data = [0u8; 8];
        data[..4].copy_from_slice(&address.to_be_bytes());
        data[4..].copy_from_slice(&byte_count.to_be_bytes());

        self.command(constants::CC2538_CMD_ERASE, &data, constants::ERASE_TIMEOUT)
            .await?;
        self.check_last_cmd(Operation::Erase).await
    }

    /// Sector erase. Only supported on [`Family::CC26X0`] and [`Family::CC26X2`].
    ///
    /// The size of each sector is specified at [`Family::sector_size`].
    ///
    /// See [`util::erase_flash_range`] for an easier to use wrapper of this
    /// function.
    pub async fn sector_erase(&mut self, address: u32) -> Result<()> {
        self.command(
            constants::CC26X0_CMD_SECTOR_ERASE,
            &address.to_be_bytes(),
            constants::SECTOR_ERASE_TIMEOUT,
        )
        .await?;
        self.check_last_cmd(Operation::SectorErase).await
    }

    /// Erase all the unprotected flash sectors. Only supported on
    /// [`Family::CC26X0`] and [`Family::CC26X2`].
    pub async fn bank_erase(&mut self) -> Result<()> {
        self.command(
            constants::CC26X0_CMD_BANK_ERASE,
            &[],
            constants::BANK_ERASE_TIMEOUT,
        )
        .await?;
        self.check_last_cmd(Operation::BankErase).await
    }

    /// Program `chunk` at `address`.
    ///
    /// The chunk is padded with `0xFF` to a multiple of 4 bytes, announced
    /// with `COMMAND_DOWNLOAD` and then sent with `COMMAND_SEND_DATA`, both
    /// confirmed with a status check.
    pub async fn download_to(&mut self, address: u32, chunk: &[u8]) -> Result<()> {
        let mut data = chunk.to_vec();
        let padded_len = (data.len() + 3) & !3;
        data.resize(padded_len, 0xFF);

        let mut header = [0u8; 8];
        header[..4].copy_from_slice(&address.to_be_bytes());
        header[4..].copy_from_slice(&(padded_len as u32).to_be_bytes());

        log::trace!("download {} bytes at {:#X}", padded_len, address);

        self.command(constants::CMD_DOWNLOAD, &header, constants::ACK_TIMEOUT)
            .await?;
        self.check_last_cmd(Operation::DownloadHeader).await?;

        self.command(
            constants::CMD_SEND_DATA,
            &data,
            constants::SEND_DATA_TIMEOUT,
        )
        .await?;
        self.check_last_cmd(Operation::SendData).await
    }

    /// Calculate the CRC32 of a flash range (CC2538 form).
    pub async fn crc32(&mut self, address: u32, byte_count: u32) -> Result<u32> {
        let mut data = [0u8; 8];
        data[..4].copy_from_slice(&address.to_be_bytes());
        data[4..].copy_from_slice(&byte_count.to_be_bytes());

        self.read_crc32(&data).await
    }

    /// Calculate the CRC32 of a flash range (CC26xx/CC13xx form, with a zero
    /// "number of reads" field).
    pub async fn crc32_cc26xx(
        &mut self,
        address: u32,
        byte_count: u32,
    ) -> Result<u32> {
        let mut data = [0u8; 12];
        data[..4].copy_from_slice(&address.to_be_bytes());
        data[4..8].copy_from_slice(&byte_count.to_be_bytes());

        self.read_crc32(&data).await
    }

    async fn read_crc32(&mut self, data: &[u8]) -> Result<u32> {
        let packet = self.query(constants::CMD_CRC32, data).await?;
        if packet.len() < 4 {
            return Err(Error::ShortResponse {
                operation: Operation::Crc32,
                expected: 4,
                found: packet.len(),
            });
        }
        self.check_last_cmd(Operation::Crc32).await?;

        // Least significant byte first.
        Ok(u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]))
    }

    /// Read memory.
    ///
    /// # Parameters
    ///
    /// - `address`: the memory address to read.
    /// - `width`: access type code, `0` for 8-bit and `1` for 32-bit.
    /// - `count`: number of accesses.
    pub async fn memory_read(
        &mut self,
        address: u32,
        width: u8,
        count: u8,
    ) -> Result<Vec<u8>> {
        log::trace!(
            "memory_read `{}` elements at start address `{:#X}`",
            count,
            address
        );

        let mut cmd = [0u8; 6];
        cmd[..4].copy_from_slice(&address.to_be_bytes()); /* address */
        cmd[4] = width; /* access type */
        cmd[5] = count; /* number of accesses */

        let packet = self.query(constants::CMD_MEMORY_READ, &cmd).await?;
        self.check_last_cmd(Operation::MemoryRead).await?;

        Ok(packet)
    }

    /// Read a single 32-bit word, returned in the order the bootloader sent
    /// it.
    pub async fn memory_read_32(&mut self, address: u32) -> Result<[u8; 4]> {
        let data = self
            .memory_read(address, constants::MEMORY_READ_WIDTH_32, 1)
            .await?;

        word(&data)
    }

    /// Read a single 32-bit word using the CC2538 form of
    /// `COMMAND_MEMORY_READ`, where the width is given in bytes and there's
    /// no access count.
    pub async fn memory_read_cc2538(&mut self, address: u32) -> Result<[u8; 4]> {
        let mut cmd = [0u8; 5];
        cmd[..4].copy_from_slice(&address.to_be_bytes());
        cmd[4] = 4;

        let packet = self.query(constants::CMD_MEMORY_READ, &cmd).await?;
        self.check_last_cmd(Operation::MemoryRead).await?;

        word(&packet)
    }
}

fn word(data: &[u8]) -> Result<[u8; 4]> {
    match data.get(..4) {
        Some(word) => Ok([word[0], word[1], word[2], word[3]]),
        None => Err(Error::ShortResponse {
            operation: Operation::MemoryRead,
            expected: 4,
            found: data.len(),
        }),
    }
}

impl<L> fmt::Debug for Device<L> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Device")
            .field("link", &())
            .field("pending", &lock(&self.rx).buf.len())
            .finish()
    }
}

fn command_checksum(cmd: u8, data: &[u8]) -> u8 {
    cmd.wrapping_add(payload_checksum(data))
}

fn payload_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

/// Default serial port settings.
///
/// It's recommended to change only the baudrate since all other
/// options are the same for all Texas Instruments devices.
pub fn port_settings() -> serial::PortSettings {
    serial::PortSettings {
        baud_rate: serial::BaudRate::Baud115200,
        char_size: serial::CharSize::Bits8,
        parity: serial::Parity::ParityNone,
        stop_bits: serial::StopBits::Stop1,
        flow_control: serial::FlowControl::FlowNone,
    }
}
