//! Run artifacts: bincode blobs and JSON reports.
//!
//! Every write goes to a temp file first and is renamed into place.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sparq_core::{Error, Result};
use tracing::debug;

/// Loads a bincode artifact.
pub fn load_bincode<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|e| Error::external(path, e))?;
    let value = bincode::deserialize_from(BufReader::new(file))
        .map_err(|e| Error::corrupted(format!("invalid artifact {}: {}", path.display(), e)))?;
    debug!(path = %path.display(), "loaded artifact");
    Ok(value)
}

/// Saves a bincode artifact, creating parent directories.
pub fn save_bincode<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    write_atomic(path, |writer| Ok(bincode::serialize_into(writer, value)?))
}

/// Saves a JSON document. `pretty` uses two-space indentation.
pub fn save_json<T: Serialize>(path: &Path, value: &T, pretty: bool) -> Result<()> {
    write_atomic(path, |writer| {
        if pretty {
            serde_json::to_writer_pretty(writer, value)?;
        } else {
            serde_json::to_writer(writer, value)?;
        }
        Ok(())
    })
}

fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| Error::external(parent, e))?;
    }
    let temp_path = path.with_extension("tmp");
    let file = File::create(&temp_path).map_err(|e| Error::external(&temp_path, e))?;
    let mut writer = BufWriter::new(file);
    write(&mut writer)?;
    writer.flush()?;
    drop(writer);

    fs::rename(&temp_path, path)
        .map_err(|e| Error::io(format!("failed to rename {}: {}", path.display(), e)))?;
    debug!(path = %path.display(), "saved artifact");
    Ok(())
}
