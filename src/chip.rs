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

//! Chip model identification.

use std::fmt;

/// Chip IDs reported by the CC2538 bootloader.
pub const CC2538_CHIP_IDS: [u16; 2] = [0xB964, 0xB965];

/// Whether `chip_id` belongs to a CC2538.
#[inline]
pub fn is_cc2538(chip_id: u16) -> bool {
    CC2538_CHIP_IDS.contains(&chip_id)
}

/// Extract the 16-bit chip ID from a `COMMAND_GET_CHIP_ID` response.
///
/// The ID is carried in the last two bytes of the packet, most significant
/// byte first. Returns `None` for packets shorter than two bytes.
pub fn chip_id_from_packet(packet: &[u8]) -> Option<u16> {
    match packet {
        [.., hi, lo] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

/// Identity of a chip as read from the bootloader and the ICEPICK
/// registers.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct ChipIdentity {
    pub chip_id: u16,
    pub wafer_id: u16,
    pub pg_rev: u8,
    pub mode_cfg: u8,
}

impl ChipIdentity {
    /// Identity of a chip known only by its chip ID.
    pub fn from_chip_id(chip_id: u16) -> Self {
        ChipIdentity {
            chip_id,
            ..Default::default()
        }
    }

    /// Decode the ICEPICK device ID word and the mode configuration word,
    /// both in the byte order returned by a 32-bit memory read.
    pub fn from_registers(chip_id: u16, device_id: [u8; 4], user_id: [u8; 4]) -> Self {
        let [_, d1, d2, d3] = device_id;
        let raw = (u32::from(d3 & 0x0F) << 16)
            | (u32::from(d2) << 8)
            | u32::from(d1 & 0xF0);

        ChipIdentity {
            chip_id,
            wafer_id: (raw >> 4) as u16,
            pg_rev: d3 >> 4,
            mode_cfg: user_id[1],
        }
    }

    /// Model name, or `None` when the identity matches no known model.
    pub fn known_model(&self) -> Option<&'static str> {
        let ChipIdentity {
            chip_id,
            wafer_id,
            pg_rev,
            mode_cfg,
        } = *self;

        let model = match (chip_id, wafer_id, pg_rev, mode_cfg) {
            (0xB964, ..) | (0xB965, ..) => "CC2538",
            (0x1202, 0xBB77, 0x1, _) => "CC2652P7",
            (0x1282, 0xBB77, 0x1, _) => "CC1352P7",
            (0x3202, 0xBB41, 0x3, 0xC1) => "CC2652P2_launchpad",
            (0x3202, 0xBB41, 0x3, 0xFA) => "CC2652P2_other",
            (0x3202, 0xBB41, 0x3, _) => "CC2652P2",
            (0x3102, 0xBB41, 0x3, _) => "CC2652RB",
            _ => return None,
        };

        Some(model)
    }

    /// Model name, unknown identities are described by their fields.
    pub fn model(&self) -> String {
        match self.known_model() {
            Some(model) => model.to_owned(),
            None => format!(
                "Unknown (C:{:X},W:{:X},P:{:X},M:{:X})",
                self.chip_id, self.wafer_id, self.pg_rev, self.mode_cfg
            ),
        }
    }
}

impl fmt::Display for ChipIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.model())
    }
}
