//! logging: the daily operational log
//!
//! [`DailyLog`] is a `tracing_subscriber` writer that appends to
//! `log_YYYY_MM_DD.txt` under the log directory, picking the file by the
//! local date at the time of each event. [`operational_layer`] wraps it in
//! an ERROR-only fmt layer that prints `timestamp message fields`.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate};
use tracing::{Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::registry::LookupSpan;

#[derive(Debug, Clone)]
pub struct DailyLog {
    dir: PathBuf,
}

impl DailyLog {
    pub fn new<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(date.format("log_%Y_%m_%d.txt").to_string())
    }

    pub fn current_path(&self) -> PathBuf {
        self.path_for(Local::now().date_naive())
    }

    fn open(&self) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.current_path())
    }
}

/// Writer for one event. Swallows output if the file could not be opened;
/// the stderr layer still carries the event.
pub enum DailyLogWriter {
    File(File),
    Unavailable,
}

impl Write for DailyLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::File(f) => f.write(buf),
            Self::Unavailable => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::File(f) => f.flush(),
            Self::Unavailable => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DailyLog {
    type Writer = DailyLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        match self.open() {
            Ok(file) => DailyLogWriter::File(file),
            Err(_) => DailyLogWriter::Unavailable,
        }
    }
}

/// ERROR-only, ANSI-free fmt layer writing through `log`.
pub fn operational_layer<S>(log: DailyLog) -> impl Layer<S> + Send + Sync + 'static
where
    S: Subscriber + for<'span> LookupSpan<'span> + 'static,
{
    fmt::layer()
        .with_writer(log.with_max_level(Level::ERROR))
        .with_ansi(false)
        .with_target(false)
        .with_level(false)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn file_name_uses_date() {
        let log = DailyLog {
            dir: PathBuf::from("logs"),
        };
        let date = NaiveDate::from_ymd_opt(2024, 1, 9).unwrap();
        assert_eq!(log.path_for(date), Path::new("logs/log_2024_01_09.txt"));
    }

    #[test]
    fn only_errors_reach_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = DailyLog::new(dir.path().join("logs")).unwrap();
        let path = log.current_path();
        let subscriber = tracing_subscriber::registry().with(operational_layer(log));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("routine progress");
            tracing::error!(track_id = 4, "clip encoding failed");
        });

        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("clip encoding failed"));
        assert!(text.contains("track_id=4"));
        assert!(!text.contains("routine progress"));
    }
}
