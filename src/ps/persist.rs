//! Signed on-disk copy of the process snapshot.
//!
//! The agent saves every [`PsRecord`] on shutdown and restores them on the
//! next start so enrichment does not begin blind. The file is JSON with an
//! HMAC-SHA256 over the serialized records; a file whose signature does not
//! verify is rejected as a whole.

use hmac::{Hmac, Mac};
use log::Level;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::{
    fs::{self, File},
    io::{self, BufReader, Write},
    path::Path,
};
use thiserror::Error;

use super::PsRecord;
use crate::ktrace_log;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("snapshot I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("snapshot JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("snapshot signature mismatch")]
    SignatureMismatch,

    #[error("invalid signing key")]
    InvalidKey,
}

/// File layout: records plus the hex HMAC of their serialized form.
#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    records: Vec<PsRecord>,
    signature: String,
}

fn signer(key: &[u8]) -> Result<HmacSha256, PersistError> {
    HmacSha256::new_from_slice(key).map_err(|_| PersistError::InvalidKey)
}

fn sign(key: &[u8], data: &str) -> Result<String, PersistError> {
    let mut mac = signer(key)?;
    mac.update(data.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Loads and verifies the snapshot at `path`. A missing file is an empty
/// snapshot, not an error.
pub fn load_snapshot<P: AsRef<Path>>(path: P, key: &[u8]) -> Result<Vec<PsRecord>, PersistError> {
    let path = path.as_ref();
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            ktrace_log!(Level::Info, "snapshot", "no snapshot at {:?}, starting empty", path);
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };
    let wrapper: SnapshotFile = serde_json::from_reader(BufReader::new(file))?;

    let data = serde_json::to_string(&wrapper.records)?;
    let expected = hex::decode(&wrapper.signature).map_err(|_| PersistError::SignatureMismatch)?;
    let mut mac = signer(key)?;
    mac.update(data.as_bytes());
    mac.verify_slice(&expected)
        .map_err(|_| PersistError::SignatureMismatch)?;

    ktrace_log!(
        Level::Info,
        "snapshot",
        "loaded {} process record(s) from {:?}",
        wrapper.records.len(),
        path
    );
    Ok(wrapper.records)
}

/// Signs and writes `records` to `path`, replacing it atomically.
pub fn save_snapshot<P: AsRef<Path>>(path: P, key: &[u8], records: &[PsRecord]) -> Result<(), PersistError> {
    let path = path.as_ref();
    let data = serde_json::to_string(records)?;
    let wrapper = SnapshotFile {
        signature: sign(key, &data)?,
        records: records.to_vec(),
    };
    let serialized = serde_json::to_vec_pretty(&wrapper)?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&serialized)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;

    ktrace_log!(
        Level::Info,
        "snapshot",
        "saved {} process record(s) to {:?}",
        records.len(),
        path
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ps::Ps;
    use std::collections::BTreeMap;

    const KEY: &[u8] = b"test-key";

    fn records() -> Vec<PsRecord> {
        let mut envs = BTreeMap::new();
        envs.insert("PATH".into(), r"C:\Windows".into());
        vec![Ps::new(42, 4, r"C:\a.exe", r"C:\", "a.exe -x", None, envs).to_record()]
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("snapshot.json");
        save_snapshot(&path, KEY, &records()).unwrap();
        assert_eq!(load_snapshot(&path, KEY).unwrap(), records());
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_snapshot(dir.path().join("absent.json"), KEY).unwrap().is_empty());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        save_snapshot(&path, KEY, &records()).unwrap();
        assert!(matches!(
            load_snapshot(&path, b"other-key"),
            Err(PersistError::SignatureMismatch)
        ));
    }

    #[test]
    fn tampered_records_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        save_snapshot(&path, KEY, &records()).unwrap();
        let text = fs::read_to_string(&path).unwrap().replace("a.exe -x", "evil.exe");
        fs::write(&path, text).unwrap();
        assert!(matches!(
            load_snapshot(&path, KEY),
            Err(PersistError::SignatureMismatch)
        ));
    }
}
