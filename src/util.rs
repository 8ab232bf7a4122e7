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

//! # Utilities
//!
//! These are convenience functions built on top of the bootloader commands:
//! reading the chip identity, the flash size and the IEEE 802.15.4 address,
//! erasing, programming and verifying the flash.

use std::time::Duration;

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::{
    chip::{self, ChipIdentity},
    constants::{
        COMMAND_RET_FLASH_FAIL, COMMAND_RET_INVALID_ADR, COMMAND_RET_INVALID_CMD,
        COMMAND_RET_SUCCESS, COMMAND_RET_UNKNOWN_CMD, WRITE_CHUNK_SIZE,
    },
    link::ByteLink,
    Device, Error, Family, Operation, Result,
};

/// FLASH.FLASH_SIZE register on CC13xx/CC26xx
const CC26XX_FLASH_O_FLASH_SIZE: u32 = 0x4003002C;
/// FCFG1.MAC_15_4_0, primary IEEE 802.15.4 address on CC13xx/CC26xx
const CC26XX_FCFG1_MAC_15_4_0: u32 = 0x500012F0;
/// ICEPICK device identification register.
const CC26XX_ICEPICK_DEVICE_ID: u32 = 0x50001318;
/// FCFG1.TESXT_ID, holds the mode configuration in its second byte.
const CC26XX_FCFG1_TESXT_ID: u32 = 0x00057FB4;
/// FLASH_CTRL.DIECFG0 register on CC2538
const CC2538_FLASH_CTRL_O_DIECFG0: u32 = 0x400D3014;
/// Primary IEEE 802.15.4 address on CC2538
const CC2538_IEEE_ADDRESS_PRIMARY: u32 = 0x00280028;
/// Texas Instruments OUI
const TI_OUI: [u8; 3] = [0x00, 0x12, 0x4B];

/// CC26xx/CC13xx CCFG size in bytes, at the end of the flash.
pub const CCFG_SIZE: u32 = 88;

/// Attempts per chunk when programming.
pub const WRITE_ATTEMPTS: usize = 3;
/// Pause between attempts of the same chunk.
pub const WRITE_RETRY_DELAY: Duration = Duration::from_millis(500);

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Link failures can't be fixed by trying again.
fn is_link_error(e: &Error) -> bool {
    matches!(e, Error::NotConnected | Error::Io(_))
}

/// Read the chip identity.
///
/// `chip_id_packet` is the response of [`Device::chip_id`]. CC2538 chips
/// are identified by the chip ID alone, on CC26xx/CC13xx the ICEPICK device
/// ID and the mode configuration are read.
pub async fn read_chip_identity<L>(
    device: &mut Device<L>,
    chip_id_packet: &[u8],
) -> Result<ChipIdentity>
where
    L: ByteLink,
{
    let chip_id = chip::chip_id_from_packet(chip_id_packet).ok_or(
        Error::ShortResponse {
            operation: Operation::ChipId,
            expected: 2,
            found: chip_id_packet.len(),
        },
    )?;

    if chip::is_cc2538(chip_id) {
        return Ok(ChipIdentity::from_chip_id(chip_id));
    }

    let device_id = device.memory_read_32(CC26XX_ICEPICK_DEVICE_ID).await?;
    let user_id = device.memory_read_32(CC26XX_FCFG1_TESXT_ID).await?;

    let identity = ChipIdentity::from_registers(chip_id, device_id, user_id);
    log::debug!("chip identity {:?}", identity);

    Ok(identity)
}

/// Reads the flash size from the memory.
pub async fn read_flash_size<L>(device: &mut Device<L>, family: Family) -> Result<u32>
where
    L: ByteLink,
{
    match family {
        Family::CC2538 => {
            let reg = device.memory_read_cc2538(CC2538_FLASH_CTRL_O_DIECFG0).await?;
            let flash_size = (reg[3] >> 4) & 0x07;
            match flash_size {
                1 => Ok(0x20000), // 128 KB
                2 => Ok(0x40000), // 256 KB
                3 => Ok(0x60000), // 384 KB
                4 => Ok(0x80000), // 512 KB
                0 => Ok(0x10000), //  64 KB
                _ => Ok(0x10000), // All invalid values are interpreted as 64 KB
            }
        }
        Family::CC26X0 | Family::CC26X2 => {
            let reg = device.memory_read_32(CC26XX_FLASH_O_FLASH_SIZE).await?;
            let pages = u32::from(reg[0]);

            Ok(pages * family.sector_size())
        }
    }
}

/// Read the primary IEEE 802.15.4 address, most significant byte first.
pub async fn read_ieee_address<L>(
    device: &mut Device<L>,
    family: Family,
) -> Result<[u8; 8]>
where
    L: ByteLink,
{
    let mut address = [0u8; 8];

    match family {
        Family::CC2538 => {
            let start = device.memory_read_cc2538(CC2538_IEEE_ADDRESS_PRIMARY).await?;
            let end = device
                .memory_read_cc2538(CC2538_IEEE_ADDRESS_PRIMARY + 4)
                .await?;

            if start[..3] == TI_OUI {
                address[..4].copy_from_slice(&start);
                address[4..].copy_from_slice(&end);
            } else {
                address[..4].copy_from_slice(&end);
                address[4..].copy_from_slice(&start);
            }
        }
        Family::CC26X0 | Family::CC26X2 => {
            let lo = device.memory_read_32(CC26XX_FCFG1_MAC_15_4_0).await?;
            let hi = device.memory_read_32(CC26XX_FCFG1_MAC_15_4_0 + 4).await?;

            address[..4].copy_from_slice(&lo);
            address[4..].copy_from_slice(&hi);
            address.reverse();
        }
    }

    Ok(address)
}

/// Whether writing `byte_count` bytes at `start_address` reaches the CCFG
/// of a CC26xx/CC13xx device with `flash_size` bytes of flash. A bad CCFG
/// may lock the device.
pub fn overwrites_ccfg(family: Family, flash_size: u32, start_address: u32, byte_count: u32) -> bool {
    if family == Family::CC2538 || flash_size < CCFG_SIZE {
        return false;
    }

    let ccfg_offset = family.flash_base() + flash_size - CCFG_SIZE;
    log::trace!("CCFG offset: {:#X}", ccfg_offset);

    start_address.saturating_add(byte_count) > ccfg_offset
}

/// Format an IEEE address as `00:12:4B:...`.
pub fn format_ieee_address(address: &[u8; 8]) -> String {
    address
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Erase a flash range.
///
/// CC2538 uses the range erase command, CC26xx/CC13xx erase every sector
/// overlapping the range.
pub async fn erase_flash_range<L>(
    device: &mut Device<L>,
    family: Family,
    start_address: u32,
    byte_count: u32,
) -> Result<()>
where
    L: ByteLink,
{
    if family.supports_erase() {
        log::info!("Erasing {} bytes at {:#X}", byte_count, start_address);
        return device.erase(start_address, byte_count).await;
    }

    let sector_size = family.sector_size();
    let first = start_address - (start_address % sector_size);
    let end = start_address + byte_count;
    let sector_count = (end - first + sector_size - 1) / sector_size;

    for i in 0..sector_count {
        let sector_address = first + (i * sector_size);
        log::info!("Erasing sector #{}, address: {:#X}", i, sector_address);

        device.sector_erase(sector_address).await?;
    }

    Ok(())
}

/// Erase the flash before programming `byte_count` bytes at
/// `start_address`.
///
/// CC26xx/CC13xx try a bank erase first and fall back to erasing the
/// sectors of the range.
pub async fn erase_flash<L>(
    device: &mut Device<L>,
    family: Family,
    start_address: u32,
    byte_count: u32,
) -> Result<()>
where
    L: ByteLink,
{
    if !family.supports_bank_erase() {
        return erase_flash_range(device, family, start_address, byte_count).await;
    }

    match device.bank_erase().await {
        Ok(()) => {
            log::info!("Bank erase done");
            Ok(())
        }
        Err(e) if is_link_error(&e) => Err(e),
        Err(e) => {
            log::warn!("Bank erase failed ({}), erasing sectors", e);
            erase_flash_range(device, family, start_address, byte_count).await
        }
    }
}

/// Write the flash.
///
/// The image is sent in chunks of [`WRITE_CHUNK_SIZE`] bytes, chunks made
/// only of `0xFF` are skipped. Each chunk is tried [`WRITE_ATTEMPTS`] times.
/// `progress` receives the number of bytes processed and the image size.
pub async fn write_flash_range<L, F>(
    device: &mut Device<L>,
    start_address: u32,
    image: &[u8],
    mut progress: F,
) -> Result<()>
where
    L: ByteLink,
    F: FnMut(usize, usize),
{
    let total = image.len();
    log::info!("Writing {} bytes at {:#X}", total, start_address);

    for (chunk_index, chunk) in image.chunks(WRITE_CHUNK_SIZE).enumerate() {
        let offset = chunk_index * WRITE_CHUNK_SIZE;
        let chunk_addr = start_address + offset as u32;

        if chunk.iter().all(|b| *b == 0xFF) {
            log::trace!("Skipping erased chunk #{} at {:#X}", chunk_index, chunk_addr);
        } else {
            log::debug!(
                "Writing chunk #{} ({} B) at address {:#X}",
                chunk_index,
                chunk.len(),
                chunk_addr
            );

            let mut attempt = 1;
            loop {
                match device.download_to(chunk_addr, chunk).await {
                    Ok(()) => break,
                    Err(e) if is_link_error(&e) || attempt >= WRITE_ATTEMPTS => {
                        return Err(e)
                    }
                    Err(e) => {
                        log::warn!(
                            "Chunk #{} at {:#X} failed (attempt {}/{}): {}",
                            chunk_index,
                            chunk_addr,
                            attempt,
                            WRITE_ATTEMPTS,
                            e
                        );
                        attempt += 1;
                        tokio::time::sleep(WRITE_RETRY_DELAY).await;
                    }
                }
            }
        }

        progress(offset + chunk.len(), total);
    }

    Ok(())
}

/// Result of comparing the device CRC32 with the local image.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CrcCheck {
    pub device: u32,
    pub local: u32,
}

impl CrcCheck {
    pub fn matches(&self) -> bool {
        self.device == self.local
    }
}

/// Compute the CRC32 of the flash range where `image` was written and
/// compare it with the CRC32 of `image`.
pub async fn verify_crc<L>(
    device: &mut Device<L>,
    family: Family,
    start_address: u32,
    image: &[u8],
) -> Result<CrcCheck>
where
    L: ByteLink,
{
    let len = image.len() as u32;
    let device_crc = if family.crc32_with_read_count() {
        device.crc32_cc26xx(start_address, len).await?
    } else {
        device.crc32(start_address, len).await?
    };

    let check = CrcCheck {
        device: device_crc,
        local: CRC32.checksum(image),
    };
    log::debug!("CRC32 device={:#010X} local={:#010X}", check.device, check.local);

    Ok(check)
}

pub fn status_code_to_str(ret: u8) -> &'static str {
    match ret {
        COMMAND_RET_SUCCESS => "COMMAND_RET_SUCCESS",
        COMMAND_RET_UNKNOWN_CMD => "COMMAND_RET_UNKNOWN_CMD",
        COMMAND_RET_INVALID_CMD => "COMMAND_RET_INVALID_CMD",
        COMMAND_RET_INVALID_ADR => "COMMAND_RET_INVALID_ADR",
        COMMAND_RET_FLASH_FAIL => "COMMAND_RET_FLASH_FAIL",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        constants,
        test::{fake_device, FakeBootloader},
    };

    fn cmds(bootloader: &FakeBootloader, cmd: u8) -> Vec<Vec<u8>> {
        bootloader
            .commands
            .iter()
            .filter(|(c, _)| *c == cmd)
            .map(|(_, content)| content.clone())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_chip_identity() {
        let mut memory = HashMap::new();
        memory.insert(CC26XX_ICEPICK_DEVICE_ID, [0x2F, 0x10, 0xB4, 0x3B]);
        memory.insert(CC26XX_FCFG1_TESXT_ID, [0x00, 0xFA, 0x00, 0x00]);
        let (mut device, _) = fake_device(FakeBootloader {
            memory,
            ..Default::default()
        });

        let identity = read_chip_identity(&mut device, &[0x00, 0x00, 0x32, 0x02])
            .await
            .unwrap();
        assert_eq!(identity.model(), "CC2652P2_other");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cc2538_identity_reads_nothing() {
        let (mut device, bootloader) = fake_device(FakeBootloader::default());
        let identity = read_chip_identity(&mut device, &[0x00, 0x00, 0xB9, 0x64])
            .await
            .unwrap();
        assert_eq!(identity.model(), "CC2538");
        assert!(bootloader.lock().unwrap().commands.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flash_size_and_ieee() {
        let mut memory = HashMap::new();
        memory.insert(CC26XX_FLASH_O_FLASH_SIZE, [0x2C, 0x00, 0x00, 0x00]);
        memory.insert(CC26XX_FCFG1_MAC_15_4_0, [0x01, 0x02, 0x03, 0x04]);
        memory.insert(CC26XX_FCFG1_MAC_15_4_0 + 4, [0x4B, 0x12, 0x00, 0x00]);
        let (mut device, _) = fake_device(FakeBootloader {
            memory,
            ..Default::default()
        });

        assert_eq!(
            read_flash_size(&mut device, Family::CC26X2).await.unwrap(),
            44 * 8192
        );

        let ieee = read_ieee_address(&mut device, Family::CC26X2).await.unwrap();
        assert_eq!(format_ieee_address(&ieee), "00:00:12:4B:04:03:02:01");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cc2538_flash_size_and_ieee() {
        let mut memory = HashMap::new();
        memory.insert(CC2538_FLASH_CTRL_O_DIECFG0, [0x00, 0x00, 0x00, 0x40]);
        memory.insert(CC2538_IEEE_ADDRESS_PRIMARY, [0xAA, 0xBB, 0xCC, 0xDD]);
        memory.insert(CC2538_IEEE_ADDRESS_PRIMARY + 4, [0x00, 0x12, 0x4B, 0x00]);
        let (mut device, _) = fake_device(FakeBootloader {
            memory,
            ..Default::default()
        });

        assert_eq!(
            read_flash_size(&mut device, Family::CC2538).await.unwrap(),
            0x80000
        );

        let ieee = read_ieee_address(&mut device, Family::CC2538).await.unwrap();
        assert_eq!(format_ieee_address(&ieee), "00:12:4B:00:AA:BB:CC:DD");
    }

    #[tokio::test(start_paused = true)]
    async fn test_erase_sectors_cover_range() {
        let (mut device, bootloader) = fake_device(FakeBootloader::default());
        erase_flash_range(&mut device, Family::CC26X2, 0x1000, 0x4000)
            .await
            .unwrap();

        let sectors = cmds(&bootloader.lock().unwrap(), constants::CC26X0_CMD_SECTOR_ERASE);
        assert_eq!(
            sectors,
            vec![vec![0x00, 0x00, 0x00, 0x00], vec![0x00, 0x00, 0x20, 0x00], vec![0x00, 0x00, 0x40, 0x00]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bank_erase_falls_back_to_sectors() {
        let (mut device, bootloader) = fake_device(FakeBootloader {
            fail: Some((constants::CC26X0_CMD_BANK_ERASE, 1)),
            ..Default::default()
        });

        erase_flash(&mut device, Family::CC26X2, 0x0, 0x2000).await.unwrap();

        let bootloader = bootloader.lock().unwrap();
        assert_eq!(cmds(&bootloader, constants::CC26X0_CMD_BANK_ERASE).len(), 1);
        assert_eq!(
            cmds(&bootloader, constants::CC26X0_CMD_SECTOR_ERASE),
            vec![vec![0x00, 0x00, 0x00, 0x00]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_skips_erased_chunks() {
        let (mut device, bootloader) = fake_device(FakeBootloader::default());

        let mut image = vec![0xFFu8; WRITE_CHUNK_SIZE * 2];
        image.extend_from_slice(&[0x01, 0x02]);

        let mut reported = Vec::new();
        write_flash_range(&mut device, 0x0, &image, |done, total| {
            reported.push((done, total))
        })
        .await
        .unwrap();

        let bootloader = bootloader.lock().unwrap();
        let downloads = cmds(&bootloader, constants::CMD_DOWNLOAD);
        assert_eq!(downloads, vec![vec![0x00, 0x00, 0x01, 0xF0, 0x00, 0x00, 0x00, 0x04]]);
        assert_eq!(
            cmds(&bootloader, constants::CMD_SEND_DATA),
            vec![vec![0x01, 0x02, 0xFF, 0xFF]]
        );
        assert_eq!(reported, vec![(248, 498), (496, 498), (498, 498)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_retries_chunk() {
        let (mut device, bootloader) = fake_device(FakeBootloader {
            fail: Some((constants::CMD_SEND_DATA, 2)),
            ..Default::default()
        });

        let start = tokio::time::Instant::now();
        write_flash_range(&mut device, 0x0, &[0x00; 8], |_, _| ())
            .await
            .unwrap();
        assert!(start.elapsed() >= WRITE_RETRY_DELAY * 2);
        assert_eq!(cmds(&bootloader.lock().unwrap(), constants::CMD_SEND_DATA).len(), 3);

        let (mut device, _) = fake_device(FakeBootloader {
            fail: Some((constants::CMD_SEND_DATA, 3)),
            ..Default::default()
        });
        let r = write_flash_range(&mut device, 0x0, &[0x00; 8], |_, _| ()).await;
        assert!(matches!(
            r,
            Err(Error::Status {
                operation: Operation::SendData,
                ..
            })
        ));
    }

    #[test]
    fn test_overwrites_ccfg() {
        let flash_size = 352 * 1024;
        assert!(!overwrites_ccfg(Family::CC26X2, flash_size, 0x0, 0x1000));
        assert!(!overwrites_ccfg(Family::CC26X2, flash_size, 0x0, flash_size - CCFG_SIZE));
        assert!(overwrites_ccfg(Family::CC26X2, flash_size, 0x0, flash_size));
        assert!(!overwrites_ccfg(Family::CC2538, 0x80000, 0x200000, 0x80000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_crc() {
        let image = b"123456789";
        let (mut device, _) = fake_device(FakeBootloader {
            crc: 0xCBF4_3926,
            ..Default::default()
        });

        let check = verify_crc(&mut device, Family::CC26X2, 0x0, image).await.unwrap();
        assert_eq!(check.local, 0xCBF4_3926);
        assert!(check.matches());

        let check = verify_crc(&mut device, Family::CC2538, 0x0, b"12345678").await.unwrap();
        assert!(!check.matches());
    }
}
