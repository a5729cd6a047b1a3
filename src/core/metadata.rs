//! Topic/channel name persistence across restarts.
//!
//! Only names and pause flags are stored; message data lives in the
//! backing queues.

use std::fmt::Debug;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::error::BrokerError;

pub const METADATA_FILE: &str = "rillmq.dat";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub version: String,
    #[serde(default)]
    pub topics: Vec<TopicMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMetadata {
    pub name: String,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub channels: Vec<ChannelMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMetadata {
    pub name: String,
    #[serde(default)]
    pub paused: bool,
}

pub trait MetadataStore: Send + Sync + Debug {
    /// `Ok(None)` when nothing has been persisted yet.
    fn load(&self) -> Result<Option<Metadata>, BrokerError>;
    fn save(&self, metadata: &Metadata) -> Result<(), BrokerError>;
}

/// Writes `<data_path>/rillmq.dat` as JSON via a temp file and rename.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(data_path: impl AsRef<Path>) -> Self {
        Self {
            path: data_path.as_ref().join(METADATA_FILE),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn metadata_err(path: &Path, err: impl std::fmt::Display) -> BrokerError {
    BrokerError::Metadata(format!("{}: {err}", path.display()))
}

impl MetadataStore for JsonFileStore {
    fn load(&self) -> Result<Option<Metadata>, BrokerError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(target: "rillmq::daemon", path = %self.path.display(), "no metadata file");
                return Ok(None);
            }
            Err(err) => return Err(metadata_err(&self.path, err)),
        };
        let metadata: Metadata =
            serde_json::from_slice(&raw).map_err(|e| metadata_err(&self.path, e))?;
        info!(
            target: "rillmq::daemon",
            path = %self.path.display(),
            topics = metadata.topics.len(),
            "loaded metadata"
        );
        Ok(Some(metadata))
    }

    fn save(&self, metadata: &Metadata) -> Result<(), BrokerError> {
        let _guard = self.write_lock.lock();
        let data = serde_json::to_vec(metadata).map_err(|e| metadata_err(&self.path, e))?;
        let tmp = self.path.with_extension(format!("dat.{}.tmp", rand::random::<u32>()));

        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        };
        write().map_err(|e| {
            let _ = fs::remove_file(&tmp);
            metadata_err(&self.path, e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());
        assert_eq!(store.load().expect("load"), None);
    }

    #[test]
    fn save_then_load_keeps_pause_flags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());
        let metadata = Metadata {
            version: "0.1.0".into(),
            topics: vec![TopicMetadata {
                name: "orders".into(),
                paused: true,
                channels: vec![ChannelMetadata {
                    name: "billing".into(),
                    paused: false,
                }],
            }],
        };
        store.save(&metadata).expect("save");
        assert_eq!(store.load().expect("load"), Some(metadata));

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn accepts_files_without_optional_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join(METADATA_FILE),
            br#"{"version":"1.2.1","topics":[{"name":"t","channels":[{"name":"c"}]}]}"#,
        )
        .expect("write");
        let loaded = JsonFileStore::new(dir.path())
            .load()
            .expect("load")
            .expect("present");
        assert!(!loaded.topics[0].paused);
        assert_eq!(loaded.topics[0].channels[0].name, "c");
    }

    #[test]
    fn corrupt_file_is_a_metadata_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(METADATA_FILE), b"{not json").expect("write");
        assert!(matches!(
            JsonFileStore::new(dir.path()).load(),
            Err(BrokerError::Metadata(_))
        ));
    }
}
