use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Append-mode log file that rolls to a timestamped archive once its size
/// crosses the roll threshold.
///
/// The active file is `<basename>.log` (or `basename` verbatim when it
/// already carries the extension); archives are named
/// `<basename>.YYYYMMDD-HHMMSS[.N].log` in UTC.
pub(crate) struct LogFile {
    path: PathBuf,
    file: File,
    written: u64,
    roll_size: u64,
}

impl LogFile {
    pub(crate) fn open(basename: &Path, roll_size: u64) -> io::Result<LogFile> {
        let path = active_path(basename);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();

        Ok(LogFile {
            path,
            file,
            written,
            roll_size,
        })
    }

    pub(crate) fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.roll_size > 0 && self.written >= self.roll_size {
            self.roll()?;
        }
        self.file.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    /// Rename the active file to its archive name and start a fresh one.
    pub(crate) fn roll(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let archive = archive_path(&self.path);
        fs::rename(&self.path, &archive)?;

        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.written = 0;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

fn active_path(basename: &Path) -> PathBuf {
    if basename.extension().map_or(false, |ext| ext == "log") {
        basename.to_path_buf()
    } else {
        let mut name = basename.as_os_str().to_os_string();
        name.push(".log");
        PathBuf::from(name)
    }
}

fn archive_path(active: &Path) -> PathBuf {
    let full = active.to_string_lossy();
    let stem = full.strip_suffix(".log").unwrap_or(&full);

    let (tm, _) = super::utc_now();
    let ts = format!(
        "{:04}{:02}{:02}-{:02}{:02}{:02}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec
    );

    let mut candidate = PathBuf::from(format!("{}.{}.log", stem, ts));
    let mut count = 0;
    while candidate.exists() {
        count += 1;
        candidate = PathBuf::from(format!("{}.{}.{}.log", stem, ts, count));
    }
    candidate
}
