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

use std::path::Path;

use ti_ncp::{
    link::ByteLink,
    mt::Znp,
    nvram::{Backup, Nvram, Report},
};

use anyhow::{bail, Context, Result};
use clap::ArgMatches;
use indicatif::{ProgressBar, ProgressStyle};

fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{bar:40}] {pos:>3}% {msg}")
            .progress_chars("=> "),
    );
    pb
}

async fn check_app<L>(znp: &Znp<L>) -> Result<()>
where
    L: ByteLink,
{
    if !znp.ping().await? {
        bail!("The Z-Stack application doesn't answer, is the device in bootloader mode?");
    }

    Ok(())
}

fn print_report(report: &Report) {
    for item in report.failures() {
        log::error!("{}: {}", item.key, item.outcome);
    }
    println!("{}", report.summary());
}

pub async fn ping<L>(znp: &Znp<L>) -> Result<()>
where
    L: ByteLink,
{
    check_app(znp).await?;
    println!("Pong");
    Ok(())
}

pub async fn version<L>(znp: &Znp<L>) -> Result<()>
where
    L: ByteLink,
{
    match znp.version().await? {
        Some(version) => println!("{}", version),
        None => bail!("No version response"),
    }
    Ok(())
}

/// Back up the NVRAM to the `OUT` file.
pub async fn read<L>(matches: &ArgMatches<'_>, znp: &Znp<L>) -> Result<()>
where
    L: ByteLink,
{
    let path = Path::new(matches.value_of("OUT").unwrap_or_default());
    check_app(znp).await?;

    let pb = progress_bar();
    let backup = Nvram::new(znp)
        .read_all(|percent, label| {
            pb.set_position(percent as u64);
            pb.set_message(label);
        })
        .await;
    pb.finish();
    let backup = backup.context("Couldn't read the NVRAM")?;

    let json = backup.to_json().context("Couldn't serialize the backup")?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Couldn't write `{}`", path.display()))?;

    log::info!("{} items saved to `{}`", backup.len(), path.display());
    Ok(())
}

/// Restore the NVRAM from the `IN` file.
pub async fn write<L>(matches: &ArgMatches<'_>, znp: &Znp<L>) -> Result<()>
where
    L: ByteLink,
{
    let path = Path::new(matches.value_of("IN").unwrap_or_default());

    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Couldn't read `{}`", path.display()))?;
    let backup = Backup::from_json(&json).context("Invalid NVRAM backup")?;
    if backup.is_empty() {
        bail!("Backup `{}` has no items", path.display());
    }

    check_app(znp).await?;

    let pb = progress_bar();
    let report = Nvram::new(znp)
        .write_all(&backup, |percent, label| {
            pb.set_position(percent as u64);
            pb.set_message(label);
        })
        .await;
    pb.finish();
    let report = report.context("Couldn't write the NVRAM")?;

    print_report(&report);
    if !report.is_success() {
        bail!("Some NVRAM items couldn't be restored");
    }

    Ok(())
}

/// Erase the NVRAM.
pub async fn erase<L>(matches: &ArgMatches<'_>, znp: &Znp<L>) -> Result<()>
where
    L: ByteLink,
{
    if !matches.is_present("yes") {
        bail!("Erasing the NVRAM removes the network settings, use --yes to confirm");
    }

    check_app(znp).await?;

    let pb = progress_bar();
    let report = Nvram::new(znp)
        .erase_all(|percent, label| {
            pb.set_position(percent as u64);
            pb.set_message(label);
        })
        .await;
    pb.finish();
    let report = report.context("Couldn't erase the NVRAM")?;

    print_report(&report);
    if !report.is_success() {
        bail!("Some NVRAM items couldn't be erased");
    }

    Ok(())
}
