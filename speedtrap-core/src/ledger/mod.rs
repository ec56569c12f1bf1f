//! ledger: append-only `Id;Speed(km/h)` record of reported violations

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::detection::TrackId;

pub const HEADER: &str = "Id;Speed(km/h)";

pub struct Ledger {
    path: PathBuf,
    file: Mutex<File>,
}

impl Ledger {
    /// Create (or replace) the ledger at `path` and write the header line.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        writeln!(file, "{HEADER}")?;
        file.flush()?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Wrap an already-open file without writing a header.
    #[cfg(test)]
    pub(crate) fn from_file<P: AsRef<Path>>(path: P, file: File) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one `<id>;<speed>` line and flush it to disk.
    pub fn append(&self, track_id: TrackId, speed_kmh: f64) -> io::Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("ledger lock poisoned"))?;
        writeln!(file, "{}", format_line(track_id, speed_kmh))?;
        file.flush()
    }

    pub fn sync(&self) -> io::Result<()> {
        let file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("ledger lock poisoned"))?;
        file.sync_all()
    }
}

pub fn format_line(track_id: TrackId, speed_kmh: f64) -> String {
    format!("{track_id};{speed_kmh:.2}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn header_then_rows() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::create(dir.path().join("day/speed.csv")).unwrap();
        ledger.append(TrackId(4), 87.0).unwrap();
        ledger.append(TrackId(11), 102.456).unwrap();

        let text = std::fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(text, "Id;Speed(km/h)\n4;87.00\n11;102.46\n");
    }

    #[test]
    fn create_replaces_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("speed.csv");
        std::fs::write(&path, "stale contents\n").unwrap();
        Ledger::create(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Id;Speed(km/h)\n");
    }
}
