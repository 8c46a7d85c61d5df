use crate::error::{ControllerError, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Movement-time curves keyed by `"{channel}-{acceleration}-{speed}"`.
///
/// The backing file is a JSON object mapping each key to an array of seconds,
/// one entry per degree of travel. It is re-read on every access so several
/// controllers can share one file.
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    path: PathBuf,
}

pub fn calibration_key(channel: u8, acceleration: u8, speed: u8) -> String {
    format!("{}-{}-{}", channel, acceleration, speed)
}

impl CalibrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CalibrationStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored curve for the triple, or an empty vector when the file or the
    /// key does not exist.
    pub fn get(&self, channel: u8, acceleration: u8, speed: u8) -> Result<Vec<f64>> {
        let Some(document) = self.read_document()? else {
            warn!("file: {} could not be opened", self.path.display());
            return Ok(Vec::new());
        };

        let key = calibration_key(channel, acceleration, speed);
        match document.get(&key) {
            Some(curve) => Ok(curve.clone()),
            None => {
                info!("Key: {} not found", key);
                Ok(Vec::new())
            }
        }
    }

    /// Inserts or replaces the curve for the triple, keeping every other key.
    pub fn set(&self, channel: u8, acceleration: u8, speed: u8, curve: &[f64]) -> Result<()> {
        let mut document = self.read_document()?.unwrap_or_default();
        document.insert(calibration_key(channel, acceleration, speed), curve.to_vec());

        let text = serde_json::to_string_pretty(&document).map_err(|e| {
            ControllerError::CalibrationIo {
                path: self.path.clone(),
                source: io::Error::new(io::ErrorKind::InvalidData, e),
            }
        })?;
        fs::write(&self.path, text).map_err(|source| ControllerError::CalibrationIo {
            path: self.path.clone(),
            source,
        })
    }

    fn read_document(&self) -> Result<Option<BTreeMap<String, Vec<f64>>>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ControllerError::CalibrationIo {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| ControllerError::CalibrationFileCorrupt {
                path: self.path.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_curve() -> Vec<f64> {
        (0..46).map(|i| 0.012 + f64::from(i) * 0.0173).collect()
    }

    #[test]
    fn key_is_hyphen_joined_decimal() {
        assert_eq!(calibration_key(0, 15, 200), "0-15-200");
    }

    #[test]
    fn missing_file_is_an_empty_curve() {
        let dir = tempdir().unwrap();
        let store = CalibrationStore::new(dir.path().join("calibration.json"));
        assert!(store.get(0, 15, 15).unwrap().is_empty());
    }

    #[test]
    fn set_then_get_returns_the_same_curve() {
        let dir = tempdir().unwrap();
        let store = CalibrationStore::new(dir.path().join("calibration.json"));
        let curve = sample_curve();

        store.set(2, 15, 15, &curve).unwrap();
        assert_eq!(store.get(2, 15, 15).unwrap(), curve);
        assert!(store.get(2, 15, 16).unwrap().is_empty());
    }

    #[test]
    fn set_keeps_unrelated_keys() {
        let dir = tempdir().unwrap();
        let store = CalibrationStore::new(dir.path().join("calibration.json"));

        store.set(0, 15, 15, &[0.1, 0.2]).unwrap();
        store.set(2, 15, 15, &[0.3]).unwrap();
        store.set(0, 15, 15, &[0.5]).unwrap();

        assert_eq!(store.get(0, 15, 15).unwrap(), vec![0.5]);
        assert_eq!(store.get(2, 15, 15).unwrap(), vec![0.3]);
    }

    #[test]
    fn corrupt_document_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("calibration.json");
        fs::write(&path, "{ \"0-15-15\": [0.1, ").unwrap();
        let store = CalibrationStore::new(&path);

        assert!(matches!(
            store.get(0, 15, 15),
            Err(ControllerError::CalibrationFileCorrupt { .. })
        ));
        assert!(matches!(
            store.set(0, 15, 15, &[1.0]),
            Err(ControllerError::CalibrationFileCorrupt { .. })
        ));
        // the damaged file is left as it was
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ \"0-15-15\": [0.1, ");
    }
}
