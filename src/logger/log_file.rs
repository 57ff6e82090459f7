//! Rolling log file: a new file per size threshold or calendar day.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;

use chrono::{Local, NaiveDate};

/// Roll conditions are only re-evaluated every this many appends; the size
/// check is cheap but the clock read is not free on the hot path.
const CHECK_EVERY_N: u32 = 1024;

const FLUSH_INTERVAL_SECS: i64 = 3;

/// Append-only log file that rolls itself. Written to by exactly one thread
/// (the async-logging back end), so no internal locking.
#[derive(Debug)]
pub struct LogFile {
    dir: PathBuf,
    basename: String,
    roll_size: u64,
    written: u64,
    appends: u32,
    day: NaiveDate,
    last_flush: i64,
    file: BufWriter<File>,
}

impl LogFile {
    /// `basename` must not contain path separators; the directory is created
    /// when missing.
    pub fn create(dir: PathBuf, basename: &str, roll_size: u64) -> std::io::Result<Self> {
        assert!(!basename.contains('/'));
        fs::create_dir_all(&dir)?;
        let now = Local::now();
        let file = open_log_file(&dir, basename)?;
        Ok(Self {
            dir,
            basename: basename.to_owned(),
            roll_size,
            written: 0,
            appends: 0,
            day: now.date_naive(),
            last_flush: now.timestamp(),
            file: BufWriter::with_capacity(64 * 1024, file),
        })
    }

    pub fn append(&mut self, data: &[u8]) {
        if let Err(err) = self.file.write_all(data) {
            eprintln!("error writing to log file: {err}");
            return;
        }
        self.written += data.len() as u64;

        if self.written > self.roll_size {
            self.roll();
            return;
        }
        self.appends += 1;
        if self.appends >= CHECK_EVERY_N {
            self.appends = 0;
            let now = Local::now();
            if now.date_naive() != self.day {
                self.roll();
            } else if now.timestamp() - self.last_flush > FLUSH_INTERVAL_SECS {
                self.last_flush = now.timestamp();
                self.flush();
            }
        }
    }

    pub fn flush(&mut self) {
        if let Err(err) = self.file.flush() {
            eprintln!("error flushing log file: {err}");
        }
    }

    fn roll(&mut self) {
        self.flush();
        match open_log_file(&self.dir, &self.basename) {
            Ok(file) => {
                let now = Local::now();
                self.file = BufWriter::with_capacity(64 * 1024, file);
                self.written = 0;
                self.appends = 0;
                self.day = now.date_naive();
                self.last_flush = now.timestamp();
            }
            Err(err) => eprintln!("error rolling log file: {err}"),
        }
    }
}

impl Drop for LogFile {
    fn drop(&mut self) {
        self.flush();
    }
}

/// `<basename>.YYYYMMDD-HHMMSS.<pid>.log`
fn log_file_name(basename: &str) -> String {
    format!(
        "{}.{}.{}.log",
        basename,
        Local::now().format("%Y%m%d-%H%M%S"),
        process::id()
    )
}

fn open_log_file(dir: &std::path::Path, basename: &str) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(log_file_name(basename)))
}

#[cfg(test)]
mod test {
    use super::{log_file_name, LogFile};
    use std::fs;
    use std::path::PathBuf;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("hearth-logfile-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn file_name_carries_basename_stamp_and_pid() {
        let name = log_file_name("hearth");
        assert!(name.starts_with("hearth."));
        assert!(name.ends_with(&format!(".{}.log", std::process::id())));
        // basename + dot + YYYYMMDD-HHMMSS
        assert_eq!(15, name.split('.').nth(1).unwrap().len());
    }

    #[test]
    fn append_lands_in_the_current_file() {
        let dir = scratch_dir("append");
        let mut file = LogFile::create(dir.clone(), "test", 1024 * 1024).unwrap();
        file.append(b"one line\n");
        file.append(b"two line\n");
        file.flush();

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert_eq!(1, entries.len());
        let content = fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        assert_eq!("one line\ntwo line\n", content);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn exceeding_roll_size_opens_a_new_file() {
        let dir = scratch_dir("roll");
        let mut file = LogFile::create(dir.clone(), "test", 64).unwrap();
        file.append(&[b'x'; 80]);
        // Size exceeded: the next append goes to a fresh file.
        file.append(b"after-roll");
        file.flush();
        drop(file);

        let count = fs::read_dir(&dir).unwrap().count();
        // The roll may land in the same wall-clock second and reuse the name;
        // either way nothing is lost.
        let mut total = 0;
        for entry in fs::read_dir(&dir).unwrap() {
            total += fs::metadata(entry.unwrap().path()).unwrap().len();
        }
        assert!(count >= 1);
        assert_eq!(90, total);
        let _ = fs::remove_dir_all(&dir);
    }
}
