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

//! # NVRAM backup
//!
//! Bulk read, erase and restore of the NCP non-volatile memory over MT/ZNP.
//!
//! Two domains are covered:
//!
//! - Legacy OSAL items, a flat 16-bit ID space probed one ID at a time.
//! - Extended items, indexed by `(table, sub_id)`. Sub-IDs of a table are
//!   scanned upwards from zero and the scan of a table stops at the first
//!   missing entry, so entries after a gap are not seen.
//!
//! Per-item failures during erase and restore never abort the operation,
//! they are collected in a [`Report`]. Only link failures are returned as
//! errors.

use std::{collections::BTreeMap, fmt, ops::RangeInclusive};

use serde::{Deserialize, Serialize};

use crate::{
    link::ByteLink,
    mt::{sys::OSAL_NV_WRITE_CHUNK, Znp},
    Result,
};

/// An extended NV table.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct NvTable {
    pub id: u16,
    pub name: &'static str,
}

/// Extended NV tables, in scan order.
pub const TABLES: [NvTable; 7] = [
    NvTable { id: 0x0001, name: "ADDRMGR" },
    NvTable { id: 0x0002, name: "BINDING_TABLE" },
    NvTable { id: 0x0003, name: "DEVICE_LIST" },
    NvTable { id: 0x0004, name: "TCLK_TABLE" },
    NvTable { id: 0x0005, name: "TCLK_IC_TABLE" },
    NvTable { id: 0x0006, name: "APS_KEY_DATA_TABLE" },
    NvTable { id: 0x0007, name: "NWK_SEC_MATERIAL_TABLE" },
];

/// Legacy item IDs probed by a scan.
pub const LEGACY_RANGES: [RangeInclusive<u16>; 2] = [0x0001..=0x03FF, 0x0F00..=0x0FFF];

/// Backup section holding the legacy items.
pub const LEGACY_SECTION: &str = "LEGACY";

/// Bytes read at most from one legacy item.
const MAX_LEGACY_LEN: u16 = 4096;

fn legacy_ids() -> impl Iterator<Item = u16> {
    LEGACY_RANGES.into_iter().flatten()
}

fn legacy_count() -> usize {
    LEGACY_RANGES
        .into_iter()
        .map(|r| usize::from(r.end() - r.start()) + 1)
        .sum()
}

fn table_name(id: u16) -> Option<&'static str> {
    TABLES.iter().find(|t| t.id == id).map(|t| t.name)
}

/// Parse an item or sub-ID key, `0x` hexadecimal or decimal.
pub fn parse_id(key: &str) -> Option<u16> {
    let key = key.trim();
    match key.strip_prefix("0x").or_else(|| key.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => key.parse().ok(),
    }
}

/// Format an item or sub-ID key as `0x` and four upper-case hex digits.
pub fn format_id(id: u16) -> String {
    format!("0x{:04X}", id)
}

/// Snapshot of the NCP NVRAM.
///
/// Serializes to a JSON object with a `LEGACY` section and one section per
/// extended table, every section mapping an ID to the item bytes in
/// lower-case hex:
///
/// ```text
/// { "LEGACY": { "0x0003": "a1b2" }, "ADDRMGR": { "0x0000": "ff00" } }
/// ```
///
/// A `legacy` section is accepted on input as well.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    #[serde(rename = "LEGACY", alias = "legacy", default)]
    pub legacy: BTreeMap<String, String>,
    #[serde(flatten)]
    pub tables: BTreeMap<String, BTreeMap<String, String>>,
}

impl Backup {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Number of items in every section.
    pub fn len(&self) -> usize {
        self.legacy.len() + self.tables.values().map(BTreeMap::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Item addressed by a bulk operation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum NvKey {
    Legacy(u16),
    Extended { table: u16, sub_id: u16 },
    /// Backup entry whose key couldn't be parsed.
    Raw { section: String, key: String },
}

impl fmt::Display for NvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NvKey::Legacy(id) => write!(f, "{}[{}]", LEGACY_SECTION, format_id(*id)),
            NvKey::Extended { table, sub_id } => match table_name(*table) {
                Some(name) => write!(f, "{}[{}]", name, format_id(*sub_id)),
                None => write!(f, "{}[{}]", format_id(*table), format_id(*sub_id)),
            },
            NvKey::Raw { section, key } => write!(f, "{}[{}]", section, key),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Outcome {
    Ok,
    Skipped,
    Failed(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Ok => f.write_str("OK"),
            Outcome::Skipped => f.write_str("skipped"),
            Outcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ItemReport {
    pub key: NvKey,
    pub outcome: Outcome,
}

/// Outcome of every item touched by an erase or restore.
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub items: Vec<ItemReport>,
}

impl Report {
    fn record(&mut self, key: NvKey, outcome: Outcome) {
        match &outcome {
            Outcome::Failed(_) => log::warn!("NVRAM {} {}", key, outcome),
            _ => log::debug!("NVRAM {} {}", key, outcome),
        }

        self.items.push(ItemReport { key, outcome });
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemReport> {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, Outcome::Failed(_)))
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn summary(&self) -> String {
        let count = |f: fn(&Outcome) -> bool| self.items.iter().filter(|i| f(&i.outcome)).count();

        format!(
            "{} ok, {} skipped, {} failed",
            count(|o| *o == Outcome::Ok),
            count(|o| *o == Outcome::Skipped),
            count(|o| matches!(o, Outcome::Failed(_))),
        )
    }
}

/// Progress sink.
///
/// Percentages are clamped to `0..=100` and never decrease.
pub struct Progress<F> {
    callback: F,
    last: f64,
}

impl<F> Progress<F>
where
    F: FnMut(f64, &str),
{
    pub fn new(callback: F) -> Self {
        Progress {
            callback,
            last: 0.0,
        }
    }

    pub fn report(&mut self, percent: f64, label: &str) {
        let percent = percent.clamp(0.0, 100.0).max(self.last);
        self.last = percent;
        (self.callback)(percent, label);
    }

    /// Last reported percentage.
    pub fn last(&self) -> f64 {
        self.last
    }
}

/// Bulk NVRAM operations over an MT/ZNP session.
pub struct Nvram<'a, L> {
    znp: &'a Znp<L>,
}

impl<'a, L> Nvram<'a, L>
where
    L: ByteLink,
{
    pub fn new(znp: &'a Znp<L>) -> Self {
        Nvram { znp }
    }

    /// Whether the firmware answers extended NV commands. An empty first
    /// table still counts as supported.
    pub async fn extended_supported(&self) -> Result<bool> {
        Ok(self.znp.nv_length(TABLES[0].id, 0).await?.is_some())
    }

    /// Read both NVRAM domains.
    ///
    /// Legacy items report progress from 0 to 35 %, extended tables from 35
    /// to 90 %. Tables without entries and an unsupported extended domain
    /// are left out of the backup.
    pub async fn read_all<F>(&self, progress: F) -> Result<Backup>
    where
        F: FnMut(f64, &str),
    {
        let mut progress = Progress::new(progress);
        progress.report(0.0, "Reading...");

        let legacy = self.read_legacy(&mut progress).await?;
        let tables = self.read_extended(&mut progress).await?;

        let backup = Backup {
            legacy,
            tables: tables.unwrap_or_default(),
        };
        log::info!("read {} NVRAM items", backup.len());

        progress.report(100.0, "Done");
        Ok(backup)
    }

    async fn read_legacy<F>(&self, progress: &mut Progress<F>) -> Result<BTreeMap<String, String>>
    where
        F: FnMut(f64, &str),
    {
        let total = legacy_count();
        let mut out = BTreeMap::new();

        for (i, id) in legacy_ids().enumerate() {
            if let Some(len) = self.znp.osal_nv_length(id).await?.filter(|len| *len > 0) {
                let value = self
                    .znp
                    .osal_nv_read(id, usize::from(len.min(MAX_LEGACY_LEN)))
                    .await?;
                if value.is_empty() {
                    log::debug!("legacy item {} has length {} but no data", format_id(id), len);
                } else {
                    out.insert(format_id(id), hex::encode(value));
                }
            }

            let processed = i + 1;
            progress.report(
                processed as f64 / total as f64 * 35.0,
                &format!("Legacy {} / {}", processed, total),
            );
        }

        Ok(out)
    }

    /// `None` if the firmware doesn't support extended NV.
    async fn read_extended<F>(
        &self,
        progress: &mut Progress<F>,
    ) -> Result<Option<BTreeMap<String, BTreeMap<String, String>>>>
    where
        F: FnMut(f64, &str),
    {
        if !self.extended_supported().await? {
            log::info!("extended NV not supported, skipping tables");
            return Ok(None);
        }

        let mut out = BTreeMap::new();
        for (index, table) in TABLES.iter().enumerate() {
            let base = 35.0 + index as f64 / TABLES.len() as f64 * 55.0;
            let mut entries = BTreeMap::new();

            for sub_id in 0..=u16::MAX {
                let len = match self.znp.nv_length(table.id, sub_id).await? {
                    Some(len) if len > 0 => len,
                    _ => break,
                };
                let value = match self
                    .znp
                    .nv_read(table.id, sub_id, len.min(u32::from(u16::MAX)) as usize)
                    .await?
                {
                    Some(value) => value,
                    None => break,
                };

                entries.insert(format_id(sub_id), hex::encode(value));
                progress.report(base, &format!("{}:{}", table.name, format_id(sub_id)));
            }

            log::debug!("{}: {} entries", table.name, entries.len());
            if !entries.is_empty() {
                out.insert(table.name.to_string(), entries);
            }
        }

        Ok(Some(out))
    }

    /// Delete every legacy item and every extended entry reachable from
    /// sub-ID zero.
    ///
    /// Legacy items report progress from 0 to 50 %, extended tables from 50
    /// to 95 %.
    pub async fn erase_all<F>(&self, progress: F) -> Result<Report>
    where
        F: FnMut(f64, &str),
    {
        let mut progress = Progress::new(progress);
        let mut report = Report::default();
        progress.report(0.0, "Erasing...");

        let total = legacy_count();
        for (i, id) in legacy_ids().enumerate() {
            if let Some(len) = self.znp.osal_nv_length(id).await?.filter(|len| *len > 0) {
                let outcome = if self.znp.osal_nv_delete(id, len).await? {
                    Outcome::Ok
                } else {
                    Outcome::Failed("delete rejected".to_string())
                };
                report.record(NvKey::Legacy(id), outcome);
            }

            let processed = i + 1;
            progress.report(
                processed as f64 / total as f64 * 50.0,
                &format!("Erase legacy {} / {}", processed, total),
            );
        }

        if self.extended_supported().await? {
            for (index, table) in TABLES.iter().enumerate() {
                let base = 50.0 + index as f64 / TABLES.len() as f64 * 45.0;

                for sub_id in 0..=u16::MAX {
                    if !self.znp.nv_delete(table.id, sub_id).await? {
                        break;
                    }
                    report.record(
                        NvKey::Extended {
                            table: table.id,
                            sub_id,
                        },
                        Outcome::Ok,
                    );
                    progress.report(base, &format!("{}:{}", table.name, format_id(sub_id)));
                }
            }
        } else {
            log::info!("extended NV not supported, skipping tables");
        }

        log::info!("NVRAM erase: {}", report.summary());
        progress.report(100.0, "Erase done");
        Ok(report)
    }

    /// Restore `backup`.
    ///
    /// Legacy items report progress from 0 to 40 %, extended tables from 40
    /// to 95 %. Sections that don't name a known table are ignored.
    pub async fn write_all<F>(&self, backup: &Backup, progress: F) -> Result<Report>
    where
        F: FnMut(f64, &str),
    {
        let mut progress = Progress::new(progress);
        let mut report = Report::default();
        progress.report(0.0, "Writing...");

        let total = backup.legacy.len().max(1);
        for (i, (key, value)) in backup.legacy.iter().enumerate() {
            let (key, outcome) = match parse_id(key) {
                Some(id) => (NvKey::Legacy(id), self.write_legacy(id, value).await?),
                None => (
                    NvKey::Raw {
                        section: LEGACY_SECTION.to_string(),
                        key: key.clone(),
                    },
                    Outcome::Failed("invalid item ID".to_string()),
                ),
            };
            report.record(key, outcome);

            let count = i + 1;
            progress.report(
                count as f64 / total as f64 * 40.0,
                &format!("Legacy {} / {}", count, total),
            );
        }

        for section in backup.tables.keys() {
            if !TABLES.iter().any(|t| t.name == section) {
                log::warn!("ignoring unknown NVRAM section {}", section);
            }
        }

        let has_tables = TABLES.iter().any(|t| backup.tables.contains_key(t.name));
        if has_tables && !self.extended_supported().await? {
            log::warn!("extended NV not supported, table entries not restored");
            for table in TABLES.iter() {
                for key in backup.tables.get(table.name).into_iter().flat_map(BTreeMap::keys) {
                    let key = match parse_id(key) {
                        Some(sub_id) => NvKey::Extended {
                            table: table.id,
                            sub_id,
                        },
                        None => NvKey::Raw {
                            section: table.name.to_string(),
                            key: key.clone(),
                        },
                    };
                    report.record(key, Outcome::Skipped);
                }
            }
        } else if has_tables {
            for (index, table) in TABLES.iter().enumerate() {
                let entries = match backup.tables.get(table.name) {
                    Some(entries) => entries,
                    None => continue,
                };

                for (i, (key, value)) in entries.iter().enumerate() {
                    let (key, outcome) = match parse_id(key) {
                        Some(sub_id) => (
                            NvKey::Extended {
                                table: table.id,
                                sub_id,
                            },
                            self.write_extended(table.id, sub_id, value).await?,
                        ),
                        None => (
                            NvKey::Raw {
                                section: table.name.to_string(),
                                key: key.clone(),
                            },
                            Outcome::Failed("invalid sub-ID".to_string()),
                        ),
                    };
                    let label = key.to_string();
                    report.record(key, outcome);

                    let done = (index as f64 + (i + 1) as f64 / entries.len() as f64)
                        / TABLES.len() as f64;
                    progress.report(40.0 + done * 55.0, &label);
                }
            }
        }

        log::info!("NVRAM write: {}", report.summary());
        progress.report(100.0, "Write done");
        Ok(report)
    }

    async fn write_legacy(&self, id: u16, value: &str) -> Result<Outcome> {
        let value = match decode_value(value) {
            Ok(Some(value)) => value,
            Ok(None) => return Ok(Outcome::Skipped),
            Err(outcome) => return Ok(outcome),
        };
        let len = match u16::try_from(value.len()) {
            Ok(len) => len,
            Err(_) => return Ok(Outcome::Failed(format!("{} bytes is too long", value.len()))),
        };

        match self.znp.osal_nv_length(id).await? {
            Some(existing) if existing != 0 && existing != len => {
                log::debug!(
                    "legacy item {} has length {}, recreating with {}",
                    format_id(id),
                    existing,
                    len
                );
                if !self.znp.osal_nv_delete(id, existing).await? {
                    return Ok(Outcome::Failed("delete of the existing item rejected".to_string()));
                }
            }
            _ => (),
        }

        if !self.znp.osal_nv_item_init(id, len).await? {
            return Ok(Outcome::Failed("item init rejected".to_string()));
        }

        for (i, chunk) in value.chunks(OSAL_NV_WRITE_CHUNK).enumerate() {
            let offset = i * OSAL_NV_WRITE_CHUNK;
            if !self.znp.osal_nv_write(id, offset as u16, chunk).await? {
                return Ok(Outcome::Failed(format!("write rejected at offset {}", offset)));
            }
        }

        log::info!("NVRAM {}[{}] len={} written", LEGACY_SECTION, format_id(id), len);
        Ok(Outcome::Ok)
    }

    async fn write_extended(&self, table: u16, sub_id: u16, value: &str) -> Result<Outcome> {
        let value = match decode_value(value) {
            Ok(Some(value)) => value,
            Ok(None) => return Ok(Outcome::Skipped),
            Err(outcome) => return Ok(outcome),
        };
        // Write offsets are 16 bits.
        if value.len() > usize::from(u16::MAX) {
            return Ok(Outcome::Failed(format!("{} bytes is too long", value.len())));
        }
        let len = value.len() as u32;

        let created = match self.znp.nv_length(table, sub_id).await? {
            Some(existing) if existing != 0 && existing != len => {
                log::debug!(
                    "{} has length {}, recreating with {}",
                    NvKey::Extended { table, sub_id },
                    existing,
                    len
                );
                self.recreate(table, sub_id, len).await?
            }
            _ => {
                self.znp.nv_create(table, sub_id, len).await?
                    || self.recreate(table, sub_id, len).await?
            }
        };
        if !created {
            return Ok(Outcome::Failed("create rejected".to_string()));
        }

        if !self.znp.nv_write(table, sub_id, &value).await? {
            // An existing entry of another size rejects the write.
            if !self.recreate(table, sub_id, len).await? {
                return Ok(Outcome::Failed("create rejected".to_string()));
            }
            if !self.znp.nv_write(table, sub_id, &value).await? {
                return Ok(Outcome::Failed("write rejected".to_string()));
            }
        }

        log::info!(
            "NVRAM {} len={} written",
            NvKey::Extended { table, sub_id },
            len
        );
        Ok(Outcome::Ok)
    }

    async fn recreate(&self, table: u16, sub_id: u16, len: u32) -> Result<bool> {
        log::debug!("recreating {:#06X}:{:#06X}", table, sub_id);
        self.znp.nv_delete(table, sub_id).await?;
        self.znp.nv_create(table, sub_id, len).await
    }
}

/// `Ok(None)` for an empty value.
fn decode_value(value: &str) -> std::result::Result<Option<Vec<u8>>, Outcome> {
    if value.is_empty() {
        return Ok(None);
    }

    hex::decode(value)
        .map(Some)
        .map_err(|e| Outcome::Failed(format!("invalid hex value: {}", e)))
}
