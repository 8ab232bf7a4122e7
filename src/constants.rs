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

use std::time::Duration;

pub const CMD_PING: u8                  = 0x20;
pub const CMD_DOWNLOAD: u8              = 0x21;
pub const CMD_GET_STATUS: u8            = 0x23;
pub const CMD_SEND_DATA: u8             = 0x24;
pub const CC2538_CMD_ERASE: u8          = 0x26;
pub const CC26X0_CMD_SECTOR_ERASE: u8   = 0x26;
pub const CMD_CRC32: u8                 = 0x27;
pub const CMD_GET_CHIP_ID: u8           = 0x28;
pub const CMD_MEMORY_READ: u8           = 0x2A;
pub const CC26X0_CMD_BANK_ERASE: u8     = 0x2C;

/// Auto baud synchronization bytes.
pub const SYNC: [u8; 2]                 = [0x55, 0x55];

/// ACK byte
pub const ACK: u8                       = 0xCC;
/// NACK byte
pub const NACK: u8                      = 0x33;

/// Largest content (command byte included) of a command packet.
pub const MAX_CONTENT_LEN: usize        = 253;
/// Chunk size used when programming, keeps [`CMD_SEND_DATA`] packets
/// below the 255 byte limit once padded.
pub const WRITE_CHUNK_SIZE: usize       = 248;

/// 32-bit access width of [`CMD_MEMORY_READ`].
pub const MEMORY_READ_WIDTH_32: u8      = 1;

pub const COMMAND_RET_SUCCESS: u8       = 0x40;
pub const COMMAND_RET_UNKNOWN_CMD: u8   = 0x41;
pub const COMMAND_RET_INVALID_CMD: u8   = 0x42;
pub const COMMAND_RET_INVALID_ADR: u8   = 0x43;
pub const COMMAND_RET_FLASH_FAIL: u8    = 0x44;

pub const SYNC_TIMEOUT: Duration        = Duration::from_millis(1000);
pub const SYNC_SETTLE: Duration         = Duration::from_millis(20);
pub const ACK_TIMEOUT: Duration         = Duration::from_millis(1000);
pub const PACKET_TIMEOUT: Duration      = Duration::from_millis(1500);
pub const ERASE_TIMEOUT: Duration       = Duration::from_millis(5000);
pub const SECTOR_ERASE_TIMEOUT: Duration = Duration::from_millis(10000);
pub const BANK_ERASE_TIMEOUT: Duration  = Duration::from_millis(15000);
pub const SEND_DATA_TIMEOUT: Duration   = Duration::from_millis(5000);
