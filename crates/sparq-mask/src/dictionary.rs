//! Persisted mapping of parameter name to encoded mask.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sparq_core::{Error, Result, Tensor};
use tracing::debug;

use crate::codec::{pack, EncodedMask};

/// Mask dictionary: parameter name -> encoded mask, in insertion order.
///
/// Stored as a single bincode blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskDictionary {
    entries: IndexMap<String, EncodedMask>,
}

impl MaskDictionary {
    /// Creates an empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an already encoded mask.
    pub fn insert(&mut self, name: impl Into<String>, mask: EncodedMask) -> Option<EncodedMask> {
        self.entries.insert(name.into(), mask)
    }

    /// Encodes and adds a boolean (or numeric) tensor.
    pub fn insert_tensor(&mut self, name: impl Into<String>, tensor: &Tensor) -> Result<()> {
        self.entries.insert(name.into(), pack(tensor)?);
        Ok(())
    }

    /// Looks up a mask.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&EncodedMask> {
        self.entries.get(name)
    }

    /// Entry names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &EncodedMask)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Loads a dictionary blob.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::external(path, e))?;
        let dict: Self = bincode::deserialize_from(BufReader::new(file)).map_err(|e| {
            Error::corrupted(format!(
                "invalid mask dictionary {}: {}",
                path.display(),
                e
            ))
        })?;
        debug!(path = %path.display(), entries = dict.len(), "loaded mask dictionary");
        Ok(dict)
    }

    /// Saves the dictionary atomically (write to temp, then rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("tmp");
        let file = File::create(&temp_path).map_err(|e| Error::external(&temp_path, e))?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, self)
            .map_err(|e| Error::io(format!("failed to serialize mask dictionary: {}", e)))?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp_path, path)
            .map_err(|e| Error::io(format!("failed to rename mask dictionary: {}", e)))?;
        Ok(())
    }
}

impl FromIterator<(String, EncodedMask)> for MaskDictionary {
    fn from_iter<I: IntoIterator<Item = (String, EncodedMask)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
