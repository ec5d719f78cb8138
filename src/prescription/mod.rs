//! # Prescription Module - Record Ingestion
//!
//! Prescription exports arrive as one file per record in a watched directory.
//! Two layouts are understood:
//!
//! ```text
//! text (<record-id>.txt, legacy Korean code page or UTF-8)
//!   홍길동
//!   SYR001\Amoxicillin syrup\5\3\7\105\20240105\1
//!   code  \name             \vol\daily\period\total\date tag\line order
//!
//! xml (<record-id>.xml, UTF-8)
//!   <PtntNm>..</PtntNm> <OrderDt>YYYYMMDD</OrderDt> <OrderDtm>YYYYMMDDhhmmss</OrderDtm>
//!   <MedItem><Code/><MedNm/><Dose/><DayTakeCnt/><TakeDays/></MedItem>...
//! ```
//!
//! [`decode`] picks the text encoding, [`parser`] turns text into items, and
//! [`ingest::Ingestor`] tracks which files were already read and buckets
//! records by receipt date.

pub mod decode;
pub mod ingest;
pub mod parser;

use anyhow::anyhow;
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub use ingest::Ingestor;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Item {
    pub code: String,
    pub name: String,
    pub volume_per_dose: f64,
    pub doses_per_day: u32,
    pub period_days: u32,
    /// Amount sent to the dispenser.
    pub total_quantity: u32,
    pub date_tag: String,
    pub line_order: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrescriptionRecord {
    /// Source file name without extension.
    pub record_id: String,
    pub patient_name: String,
    /// Local wall-clock time the prescription was received.
    pub receipt_timestamp: NaiveDateTime,
    /// `None` when the file name does not start with a valid `YYYYMMDD`.
    pub receipt_date: Option<NaiveDate>,
    /// Sorted by `line_order`. A code may appear on more than one line.
    pub items: Vec<Item>,
}

/// Every line of a record that shares one item code.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemGroup<'a> {
    pub code: &'a str,
    /// Name on the first line.
    pub name: &'a str,
    pub lines: usize,
    /// Sum over the lines.
    pub total_quantity: u32,
}

impl PrescriptionRecord {
    /// Items merged by code, in order of each code's first line.
    pub fn item_groups(&self) -> Vec<ItemGroup<'_>> {
        let mut groups: Vec<ItemGroup<'_>> = Vec::new();
        for item in &self.items {
            match groups.iter_mut().find(|g| g.code == item.code) {
                Some(group) => {
                    group.lines += 1;
                    group.total_quantity = group.total_quantity.saturating_add(item.total_quantity);
                }
                None => groups.push(ItemGroup {
                    code: &item.code,
                    name: &item.name,
                    lines: 1,
                    total_quantity: item.total_quantity,
                }),
            }
        }
        groups
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrescriptionFormat {
    #[default]
    Text,
    Xml,
}

impl PrescriptionFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            PrescriptionFormat::Text => "txt",
            PrescriptionFormat::Xml => "xml",
        }
    }
}

impl FromStr for PrescriptionFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "txt" => Ok(PrescriptionFormat::Text),
            "xml" => Ok(PrescriptionFormat::Xml),
            other => Err(anyhow!(
                "unknown prescription format '{}' (expected \"text\" or \"xml\")",
                other
            )),
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} has no patient line")]
    Empty(PathBuf),
    #[error("{path} is not well-formed XML: {source}")]
    Xml {
        path: PathBuf,
        #[source]
        source: roxmltree::Error,
    },
}

/// Receipt time for a file: its creation time when the filesystem reports a
/// real one (after the epoch), otherwise `now`.
pub fn receipt_timestamp(created: Option<SystemTime>, now: NaiveDateTime) -> NaiveDateTime {
    match created {
        Some(t) if t.duration_since(UNIX_EPOCH).map_or(false, |d| !d.is_zero()) => {
            DateTime::<Local>::from(t).naive_local()
        }
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 5)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
    }

    #[test]
    fn zero_or_missing_creation_time_falls_back_to_now() {
        assert_eq!(receipt_timestamp(Some(UNIX_EPOCH), now()), now());
        assert_eq!(receipt_timestamp(None, now()), now());
        let before_epoch = UNIX_EPOCH - Duration::from_secs(10);
        assert_eq!(receipt_timestamp(Some(before_epoch), now()), now());
    }

    #[test]
    fn real_creation_time_is_used() {
        let t = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let got = receipt_timestamp(Some(t), now());
        assert_ne!(got, now());
        assert_eq!(got, DateTime::<Local>::from(t).naive_local());
    }

    #[test]
    fn repeated_codes_are_grouped_and_summed() {
        let line = |code: &str, total: u32, order: u32| Item {
            code: code.to_string(),
            name: format!("{} line {}", code, order),
            volume_per_dose: 1.0,
            doses_per_day: 1,
            period_days: 1,
            total_quantity: total,
            date_tag: String::new(),
            line_order: order,
        };
        let record = PrescriptionRecord {
            record_id: "R".to_string(),
            patient_name: "P".to_string(),
            receipt_timestamp: now(),
            receipt_date: None,
            items: vec![line("B", 10, 1), line("A", 5, 2), line("B", 15, 3)],
        };
        let groups = record.item_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!((groups[0].code, groups[0].lines, groups[0].total_quantity), ("B", 2, 25));
        assert_eq!(groups[0].name, "B line 1");
        assert_eq!((groups[1].code, groups[1].total_quantity), ("A", 5));
    }

    #[test]
    fn format_parsing() {
        assert_eq!("text".parse::<PrescriptionFormat>().unwrap(), PrescriptionFormat::Text);
        assert_eq!("XML".parse::<PrescriptionFormat>().unwrap(), PrescriptionFormat::Xml);
        assert!("csv".parse::<PrescriptionFormat>().is_err());
        assert_eq!(PrescriptionFormat::Xml.extension(), "xml");
    }
}
