//! Writing downloaded measurements to disk.

use {
    crate::{download::MeasurementRecord, error::Result},
    chrono::{DateTime, TimeZone},
    log::debug,
    std::{
        fs,
        path::{Path, PathBuf},
    },
};

/// File name for a record: `measurement_{index:03}_{YYYYMMDD_HHMMSS}.bin`.
pub fn record_file_name<Tz: TimeZone>(index: u16, timestamp: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!(
        "measurement_{index:03}_{}.bin",
        timestamp.format("%Y%m%d_%H%M%S")
    )
}

/// Write the raw bytes of `record` into `dir`, creating it if needed.
pub fn export_record<Tz: TimeZone>(
    dir: &Path,
    record: &MeasurementRecord,
    timestamp: &DateTime<Tz>,
) -> Result<PathBuf>
where
    Tz::Offset: std::fmt::Display,
{
    fs::create_dir_all(dir)?;
    let path = dir.join(record_file_name(record.index, timestamp));
    fs::write(&path, &record.data)?;
    debug!("Wrote {} bytes to {}", record.data.len(), path.display());
    Ok(path)
}
