//! Directory polling and the in-memory record book.

use chrono::{Local, NaiveDate};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::decode::decode;
use super::parser::{date_from_record_id, parse_text, parse_xml};
use super::{receipt_timestamp, IngestError, PrescriptionFormat, PrescriptionRecord};
use crate::config::IngestConfig;
use crate::metrics;

pub struct Ingestor {
    format: PrescriptionFormat,
    encodings: Vec<String>,
    min_hangul_ratio: f64,
    /// File names already turned into records.
    seen: HashSet<OsString>,
    records: BTreeMap<String, PrescriptionRecord>,
}

impl Ingestor {
    pub fn new(format: PrescriptionFormat, encodings: Vec<String>, min_hangul_ratio: f64) -> Self {
        Self {
            format,
            encodings,
            min_hangul_ratio,
            seen: HashSet::new(),
            records: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &IngestConfig) -> anyhow::Result<Self> {
        Ok(Self::new(
            config.prescription_format()?,
            config.encodings.clone(),
            config.min_hangul_ratio,
        ))
    }

    pub fn format(&self) -> PrescriptionFormat {
        self.format
    }

    /// Parse one file. `Ok(None)` when its name was already ingested.
    pub async fn ingest(&mut self, path: &Path) -> Result<Option<PrescriptionRecord>, IngestError> {
        let Some(file_name) = path.file_name().map(|n| n.to_os_string()) else {
            return Ok(None);
        };
        if self.seen.contains(&file_name) {
            return Ok(None);
        }

        let io_err = |source| IngestError::Io {
            path: path.to_path_buf(),
            source,
        };
        let bytes = fs::read(path).await.map_err(io_err)?;
        let created = fs::metadata(path)
            .await
            .map_err(io_err)?
            .created()
            .ok();
        let record_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let now = Local::now().naive_local();

        let record = match self.format {
            PrescriptionFormat::Text => {
                let decoded = decode(&bytes, &self.encodings, self.min_hangul_ratio);
                let parsed = parse_text(&decoded.text)
                    .ok_or_else(|| IngestError::Empty(path.to_path_buf()))?;
                if parsed.dropped > 0 {
                    metrics::add_lines_dropped(parsed.dropped as u64);
                    warn!(
                        "{}: dropped {} malformed line(s)",
                        path.display(),
                        parsed.dropped
                    );
                }
                debug!("{}: decoded as {}", path.display(), decoded.encoding);
                PrescriptionRecord {
                    receipt_date: date_from_record_id(&record_id),
                    receipt_timestamp: receipt_timestamp(created, now),
                    record_id,
                    patient_name: parsed.patient_name,
                    items: parsed.items,
                }
            }
            PrescriptionFormat::Xml => {
                let text = String::from_utf8_lossy(&bytes);
                let parsed = parse_xml(&text)
                    .map_err(|source| IngestError::Xml {
                        path: path.to_path_buf(),
                        source,
                    })?
                    .ok_or_else(|| IngestError::Empty(path.to_path_buf()))?;
                PrescriptionRecord {
                    receipt_date: parsed.order_date,
                    receipt_timestamp: parsed
                        .order_time
                        .unwrap_or_else(|| receipt_timestamp(created, now)),
                    record_id,
                    patient_name: parsed.patient_name,
                    items: parsed.items,
                }
            }
        };

        self.seen.insert(file_name);
        metrics::inc_files_ingested();
        info!(
            "Ingested {} ({} item(s), received {})",
            record.record_id,
            record.items.len(),
            record.receipt_timestamp.format("%Y-%m-%d %H:%M:%S")
        );
        self.records
            .insert(record.record_id.clone(), record.clone());
        Ok(Some(record))
    }

    /// Ingest every new file with the configured extension. Returns the ids of
    /// records added by this pass. A file that fails is retried next pass.
    pub async fn poll(&mut self, dir: &Path) -> Result<Vec<String>, IngestError> {
        let io_err = |source| IngestError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut entries = fs::read_dir(dir).await.map_err(io_err)?;
        let mut candidates: Vec<PathBuf> = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            let matches = path
                .extension()
                .and_then(|e| e.to_str())
                .map_or(false, |e| e.eq_ignore_ascii_case(self.format.extension()));
            if matches && !self.seen.contains(&entry.file_name()) {
                candidates.push(path);
            }
        }
        candidates.sort();

        let mut added = Vec::new();
        for path in candidates {
            match self.ingest(&path).await {
                Ok(Some(record)) => added.push(record.record_id),
                Ok(None) => {}
                Err(IngestError::Empty(p)) => debug!("{} is empty so far", p.display()),
                Err(e) => warn!("{}", e),
            }
        }
        Ok(added)
    }

    pub fn record(&self, record_id: &str) -> Option<&PrescriptionRecord> {
        self.records.get(record_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &PrescriptionRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records received on `date`, newest first.
    pub fn records_for_date(&self, date: NaiveDate) -> Vec<&PrescriptionRecord> {
        let mut out: Vec<_> = self
            .records
            .values()
            .filter(|r| r.receipt_date == Some(date))
            .collect();
        out.sort_by(|a, b| {
            b.receipt_timestamp
                .cmp(&a.receipt_timestamp)
                .then_with(|| b.record_id.cmp(&a.record_id))
        });
        out
    }

    /// Newest valid receipt date among `record_ids`.
    pub fn latest_date(&self, record_ids: &[String]) -> Option<NaiveDate> {
        record_ids
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter_map(|r| r.receipt_date)
            .max()
    }
}
