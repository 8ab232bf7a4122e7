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

use std::path::PathBuf;

use ti_ncp::{chip::ChipIdentity, link::ByteLink, util, Device, Family};

use anyhow::{bail, Context, Result};
use clap::ArgMatches;
use indicatif::{ProgressBar, ProgressStyle};

/// What is known about the connected chip.
pub struct DeviceInfo {
    pub identity: ChipIdentity,
    pub family: Family,
    pub flash_size: u32,
    pub ieee_address: [u8; 8],
}

/// Identify the chip, `family` overrides the family deduced from the chip
/// ID.
pub async fn read_info<L>(device: &mut Device<L>, family: Option<Family>) -> Result<DeviceInfo>
where
    L: ByteLink,
{
    let chip_id_packet = device
        .chip_id()
        .await
        .context("Couldn't read the chip ID")?;
    let identity = util::read_chip_identity(device, &chip_id_packet)
        .await
        .context("Couldn't read the chip identity")?;

    let family = family.unwrap_or_else(|| Family::from_chip_id(identity.chip_id));

    log::info!("Chip ID: {:#06X}", identity.chip_id);
    log::info!("Chip model: {}", identity.model());
    log::info!("Family: {}", family);

    let flash_size = util::read_flash_size(device, family)
        .await
        .context("Couldn't read flash size")?;
    log::info!("Flash size: {} KB", flash_size / 1024);

    let ieee_address = util::read_ieee_address(device, family)
        .await
        .context("Couldn't read the IEEE address")?;
    log::info!("IEEE address: {}", util::format_ieee_address(&ieee_address));

    Ok(DeviceInfo {
        identity,
        family,
        flash_size,
        ieee_address,
    })
}

/// Flash subcommand entry point.
pub async fn flash<L>(matches: &ArgMatches<'_>, device: &mut Device<L>, info: &DeviceInfo) -> Result<()>
where
    L: ByteLink,
{
    let opts = FlashOpts::from_matches(matches, info.family)?;

    let binary = tokio::fs::read(&opts.binary_path).await.with_context(|| {
        format!(
            "Couldn't read firmware file: `{}`",
            opts.binary_path.display()
        )
    })?;

    if binary.is_empty() {
        bail!("Binary file is empty");
    }

    if binary.len() > info.flash_size as usize {
        bail!("Binary size is too large");
    }

    log::info!("Binary file: `{}`", opts.binary_path.display());
    log::info!("Binary file size: {} bytes", binary.len());

    let family = info.family;
    if opts.address < family.flash_base() {
        bail!(
            "Start address out of range (base is: {:#X})",
            family.flash_base()
        );
    }

    let len = binary.len() as u32;
    let end_addr = u64::from(opts.address) + u64::from(len);
    if end_addr > u64::from(family.flash_base()) + u64::from(info.flash_size) {
        bail!("Binary file is too large for flash (end address: {:#X}, flash size: {:#X})",
              end_addr, info.flash_size);
    }

    if util::overwrites_ccfg(family, info.flash_size, opts.address, len) {
        if !opts.force {
            bail!("Binary may overwrite the CCFG, use --force if you want to flash it anyway");
        }
        log::warn!("Binary overwrites the CCFG");
    }

    if opts.write_erase {
        util::erase_flash(device, family, opts.address, len)
            .await
            .context("Couldn't erase flash")?;
    }

    let pb = ProgressBar::new(binary.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40}] {bytes}/{total_bytes} ({eta})")
            .progress_chars("=> "),
    );
    pb.set_message("Writing");

    let result = util::write_flash_range(device, opts.address, &binary, |done, _| {
        pb.set_position(done as u64)
    })
    .await;

    match result {
        Ok(()) => pb.finish_with_message("Written"),
        Err(_) => pb.abandon_with_message("Failed"),
    }
    result.context("Couldn't flash binary")?;

    if opts.verify {
        log::info!("Verifying CRC32");
        let check = util::verify_crc(device, family, opts.address, &binary)
            .await
            .context("Couldn't read the flash CRC32")?;

        if !check.matches() {
            bail!(
                "CRC32 mismatch, device: {:#010X}, binary: {:#010X}",
                check.device,
                check.local
            );
        }
        log::info!("CRC32 OK: {:#010X}", check.local);
    }

    Ok(())
}

struct FlashOpts {
    binary_path: PathBuf,
    address: u32,
    write_erase: bool,
    verify: bool,
    force: bool,
}

impl FlashOpts {
    fn from_matches(matches: &ArgMatches<'_>, family: Family) -> Result<FlashOpts> {
        let address = match matches.value_of("address") {
            Some(a) => parse_address(a).context(
                "Invalid flash address, must be an hexadecimal number, e.g.: 0x00000000",
            )?,
            None => family.flash_base(),
        };

        Ok(FlashOpts {
            binary_path: matches.value_of("BIN").unwrap_or_default().into(),
            address,
            write_erase: matches.is_present("write-erase"),
            verify: !matches.is_present("no-verify"),
            force: matches.is_present("force"),
        })
    }
}

fn parse_address(address: &str) -> Result<u32, std::num::ParseIntError> {
    let digits = address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
        .unwrap_or(address);

    u32::from_str_radix(digits, 16)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x00200000").unwrap(), 0x0020_0000);
        assert_eq!(parse_address("0X1000").unwrap(), 0x1000);
        assert_eq!(parse_address("ff").unwrap(), 0xFF);
        assert!(parse_address("0xZZ").is_err());
    }
}
