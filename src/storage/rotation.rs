//! Output file rotation
//!
//! Every packet carries its capture start time. The packet is written to the
//! file whose rotation window contains that time; when a packet belongs to a
//! later window the current file is closed and the next one is opened.
//!
//! The first file after start-up is special. If the file for the packet's
//! window already exists (the recorder was restarted), it is appended to.
//! Otherwise a new file named after the exact packet time is created, so a
//! capture session start is visible in the file names.

use chrono::{Local, TimeZone};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::buffer::Packet;
use crate::error::StorageError;
use crate::storage::naming::{align_down, OutputNames};

/// Rotation settings
#[derive(Debug, Clone)]
pub struct RotationConfig {
    /// Directory all file names are relative to
    pub base_dir: PathBuf,
    pub prefix: String,
    pub rotate_secs: u64,
    /// Hard-link files into `YYYY/MM/DD/HH` subdirectories
    pub create_dirs: bool,
}

/// Rotation counters
#[derive(Debug, Clone, Default)]
pub struct RotationStats {
    pub files_created: u64,
    pub files_appended: u64,
    pub open_failures: u64,
    pub bytes_written: u64,
    pub write_failures: u64,
    /// Bytes dropped because no file could be opened
    pub bytes_dropped: u64,
}

struct OpenFile {
    file: File,
    names: OutputNames,
    /// The subdirectory link exists, so the top-level name may be removed
    linked: bool,
}

/// Writes packets into time-rotated files
pub struct FileRotator<Tz: TimeZone = Local> {
    config: RotationConfig,
    tz: Tz,
    output: Option<OpenFile>,
    /// Start of the open file's window, the unaligned time for a fresh first file.
    /// After a failed open, the window that was attempted; the engine never moves back past it.
    window_start: Option<i64>,
    /// Set until the first file was opened successfully
    first_open: bool,
    stats: RotationStats,
}

impl FileRotator<Local> {
    /// Rotator naming files in the local time zone
    pub fn new(config: RotationConfig) -> Self {
        Self::with_timezone(config, Local)
    }
}

impl<Tz> FileRotator<Tz>
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    pub fn with_timezone(config: RotationConfig, tz: Tz) -> Self {
        Self {
            config,
            tz,
            output: None,
            window_start: None,
            first_open: true,
            stats: RotationStats::default(),
        }
    }

    /// Write a packet, rotating first if it belongs to a new window
    pub fn write_packet(&mut self, packet: &Packet, queue_depth: usize) {
        let Some(ts) = packet.epoch_secs() else {
            tracing::warn!(
                num = packet.id(),
                len = packet.len(),
                "Packet without timestamp skipped"
            );
            return;
        };
        self.write_at(ts, packet.data(), queue_depth);
    }

    /// Write `data` captured at `epoch_secs`
    pub fn write_at(&mut self, epoch_secs: i64, data: &[u8], queue_depth: usize) {
        if data.is_empty() {
            return;
        }
        self.rotate_if_needed(epoch_secs, queue_depth);

        let Some(out) = self.output.as_mut() else {
            self.stats.bytes_dropped += data.len() as u64;
            return;
        };

        tracing::trace!(
            fd = raw_descriptor(&out.file),
            len = data.len(),
            file = %out.names.file_name,
            "Writing"
        );

        let (written, err) = write_counted(&mut out.file, data);
        self.stats.bytes_written += written as u64;
        if written != data.len() {
            self.stats.write_failures += 1;
            tracing::error!(
                "Can not write data (fd:{} written {} of {} file:{}){}",
                raw_descriptor(&out.file),
                written,
                data.len(),
                out.names.file_name,
                err.map(|e| format!(": {}", e)).unwrap_or_default()
            );
        }
    }

    /// Close the open file, leaving it reachable from both locations
    pub fn finish(&mut self) {
        self.close(false);
    }

    fn rotate_if_needed(&mut self, ts: i64, queue_depth: usize) {
        let interval = self.config.rotate_secs.max(1) as i64;
        let file_time = align_down(ts, interval);

        match (self.output.is_some(), self.window_start) {
            (true, Some(start)) if file_time <= start => return,
            // A later window failed to open; older data is dropped instead of reopening its file.
            (false, Some(start)) if file_time < start => return,
            _ => {}
        }

        self.close(true);

        let mut names = OutputNames::for_time(&self.config.prefix, file_time, &self.tz);
        let mut append = false;
        if self.first_open {
            append = self.config.base_dir.join(&names.file_name).is_file();
            if !append {
                names = OutputNames::for_time(&self.config.prefix, ts, &self.tz);
            }
        }

        match self.open(&names, append, queue_depth) {
            Ok((file, linked)) => {
                if append {
                    self.stats.files_appended += 1;
                } else {
                    self.stats.files_created += 1;
                }
                self.first_open = false;
                self.window_start = Some(names.start);
                self.output = Some(OpenFile { file, names, linked });
            }
            Err(e) => {
                tracing::error!("{}", e);
                self.stats.open_failures += 1;
                self.window_start = Some(file_time);
            }
        }
    }

    /// Open the file for `names`. The flag reports whether the subdirectory link is in place.
    fn open(
        &self,
        names: &OutputNames,
        append: bool,
        queue_depth: usize,
    ) -> Result<(File, bool), StorageError> {
        let base = &self.config.base_dir;
        let path = base.join(&names.file_name);

        if self.config.create_dirs {
            if let Err(e) = create_output_directory(&base.join(&names.dir_name)) {
                tracing::warn!("{}", e);
            }
        }

        let shown = if self.config.create_dirs {
            names.linked_path()
        } else {
            PathBuf::from(&names.file_name)
        };
        let depth = if queue_depth > 0 {
            format!(" (depth:{})", queue_depth)
        } else {
            String::new()
        };

        let file = if append {
            tracing::info!(" + Append to file {}{}", shown.display(), depth);
            OpenOptions::new()
                .append(true)
                .open(&path)
                .map_err(|source| StorageError::Append { path: path.clone(), source })?
        } else {
            tracing::info!(" = Create new file {}{}", shown.display(), depth);
            create_options()
                .open(&path)
                .map_err(|source| StorageError::Create { path: path.clone(), source })?
        };

        let mut linked = false;
        if self.config.create_dirs {
            let link = base.join(names.linked_path());
            match fs::hard_link(&path, &link) {
                Ok(()) => linked = true,
                // Restarted into an existing file that is already linked.
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    linked = same_file(&path, &link);
                    if !linked {
                        tracing::warn!("{} exists and is a different file", link.display());
                    }
                }
                Err(e) => tracing::warn!(
                    "Can not link {} to {}, keeping top-level file: {}",
                    path.display(),
                    link.display(),
                    e
                ),
            }
        }

        Ok((file, linked))
    }

    /// Close the open file. With `unlink_old`, the top-level name is removed
    /// only when the file is still reachable through its subdirectory link.
    fn close(&mut self, unlink_old: bool) {
        let Some(out) = self.output.take() else {
            return;
        };
        let OpenFile { file, names, linked } = out;
        drop(file);

        if unlink_old && linked {
            let path = self.config.base_dir.join(&names.file_name);
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!("Can not unlink {}: {}", path.display(), e);
            }
        }
    }

    /// Top-level path of the open file
    pub fn current_path(&self) -> Option<PathBuf> {
        self.output
            .as_ref()
            .map(|out| self.config.base_dir.join(&out.names.file_name))
    }

    /// Names of the open file
    pub fn current_names(&self) -> Option<&OutputNames> {
        self.output.as_ref().map(|out| &out.names)
    }

    /// Start time of the open file's window
    pub fn window_start(&self) -> Option<i64> {
        self.window_start
    }

    pub fn is_open(&self) -> bool {
        self.output.is_some()
    }

    pub fn stats(&self) -> &RotationStats {
        &self.stats
    }
}

fn create_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }
    options
}

#[cfg(unix)]
fn same_file(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (fs::metadata(a), fs::metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(_a: &Path, _b: &Path) -> bool {
    false
}

fn create_output_directory(dir: &Path) -> Result<(), StorageError> {
    if dir.is_dir() {
        return Ok(());
    }
    tracing::info!(" = Create directory {}", dir.display());
    fs::create_dir_all(dir).map_err(|source| StorageError::Directory {
        path: dir.to_path_buf(),
        source,
    })
}

/// Write as much of `data` as possible, returning the byte count and the error that stopped it
fn write_counted<W: Write>(writer: &mut W, data: &[u8]) -> (usize, Option<io::Error>) {
    let mut written = 0;
    while written < data.len() {
        match writer.write(&data[written..]) {
            Ok(0) => {
                return (written, Some(io::Error::from(io::ErrorKind::WriteZero)));
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return (written, Some(e)),
        }
    }
    (written, None)
}

#[cfg(unix)]
fn raw_descriptor(file: &File) -> i64 {
    use std::os::unix::io::AsRawFd;
    i64::from(file.as_raw_fd())
}

#[cfg(not(unix))]
fn raw_descriptor(_file: &File) -> i64 {
    -1
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    /// 2023-11-14 22:13:00 UTC, a multiple of 60
    const T: i64 = 1_699_999_980;

    fn utc_rotator(dir: &Path, create_dirs: bool) -> FileRotator<Utc> {
        FileRotator::with_timezone(
            RotationConfig {
                base_dir: dir.to_path_buf(),
                prefix: "rec".into(),
                rotate_secs: 60,
                create_dirs,
            },
            Utc,
        )
    }

    fn read(path: impl AsRef<Path>) -> Vec<u8> {
        fs::read(path).unwrap()
    }

    fn ts_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_rotation_windows() {
        let dir = tempdir().unwrap();
        let mut rotator = utc_rotator(dir.path(), false);

        rotator.write_at(T, b"a", 0);
        rotator.write_at(T + 30, b"b", 0);
        rotator.write_at(T + 61, b"c", 0);
        rotator.write_at(T + 119, b"d", 0);
        rotator.write_at(T + 120, b"e", 0);
        rotator.finish();

        assert_eq!(rotator.stats().files_created, 3);
        assert_eq!(
            ts_files(dir.path()),
            vec![
                "rec-20231114_221300-1699999980.ts",
                "rec-20231114_221400-1700000040.ts",
                "rec-20231114_221500-1700000100.ts",
            ]
        );
        assert_eq!(read(dir.path().join("rec-20231114_221300-1699999980.ts")), b"ab");
        assert_eq!(read(dir.path().join("rec-20231114_221400-1700000040.ts")), b"cd");
        assert_eq!(read(dir.path().join("rec-20231114_221500-1700000100.ts")), b"e");
    }

    #[test]
    fn test_first_file_uses_unaligned_time() {
        let dir = tempdir().unwrap();
        let mut rotator = utc_rotator(dir.path(), false);

        rotator.write_at(T + 17, b"first", 0);
        assert_eq!(rotator.window_start(), Some(T + 17));
        rotator.write_at(T + 45, b"-same", 0);
        rotator.write_at(T + 60, b"next", 0);
        rotator.finish();

        assert_eq!(
            ts_files(dir.path()),
            vec!["rec-20231114_221317-1699999997.ts", "rec-20231114_221400-1700000040.ts"]
        );
        assert_eq!(read(dir.path().join("rec-20231114_221317-1699999997.ts")), b"first-same");
    }

    #[test]
    fn test_restart_appends_to_existing_window_file() {
        let dir = tempdir().unwrap();
        let existing = dir.path().join("rec-20231114_221300-1699999980.ts");
        fs::write(&existing, b"before-restart|").unwrap();

        let mut rotator = utc_rotator(dir.path(), false);
        rotator.write_at(T + 17, b"after", 0);
        rotator.finish();

        assert_eq!(rotator.stats().files_appended, 1);
        assert_eq!(rotator.stats().files_created, 0);
        assert_eq!(read(&existing), b"before-restart|after");
        assert_eq!(ts_files(dir.path()).len(), 1);
    }

    #[test]
    fn test_continuation_applies_only_to_first_file() {
        let dir = tempdir().unwrap();
        let later = dir.path().join("rec-20231114_221400-1700000040.ts");
        fs::write(&later, b"stale").unwrap();

        let mut rotator = utc_rotator(dir.path(), false);
        rotator.write_at(T, b"one", 0);
        rotator.write_at(T + 60, b"two", 0);
        rotator.finish();

        assert_eq!(read(&later), b"two");
    }

    #[test]
    fn test_subdirectory_links() {
        let dir = tempdir().unwrap();
        let mut rotator = utc_rotator(dir.path(), true);

        rotator.write_at(T, b"one", 0);
        let first_top = dir.path().join("rec-20231114_221300-1699999980.ts");
        let first_linked = dir.path().join("2023/11/14/22/rec-20231114_221300-1699999980.ts");
        assert!(first_top.is_file());
        assert!(first_linked.is_file());

        rotator.write_at(T + 60, b"two", 0);
        // Rotated out: only the subdirectory link remains
        assert!(!first_top.exists());
        assert_eq!(read(&first_linked), b"one");

        rotator.finish();
        let second_top = dir.path().join("rec-20231114_221400-1700000040.ts");
        let second_linked = dir.path().join("2023/11/14/22/rec-20231114_221400-1700000040.ts");
        assert_eq!(read(&second_top), b"two");
        assert_eq!(read(&second_linked), b"two");
    }

    #[test]
    fn test_restart_with_existing_link() {
        let dir = tempdir().unwrap();
        {
            let mut rotator = utc_rotator(dir.path(), true);
            rotator.write_at(T, b"one|", 0);
            rotator.finish();
        }

        let mut rotator = utc_rotator(dir.path(), true);
        rotator.write_at(T + 5, b"two", 0);
        rotator.finish();

        assert_eq!(rotator.stats().files_appended, 1);
        let linked = dir.path().join("2023/11/14/22/rec-20231114_221300-1699999980.ts");
        assert_eq!(read(linked), b"one|two");
    }

    #[test]
    fn test_open_failure_drops_and_retries() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("not-yet");
        let mut rotator = utc_rotator(&base, false);

        rotator.write_at(T, b"lost", 0);
        assert!(!rotator.is_open());
        assert_eq!(rotator.stats().open_failures, 1);
        assert_eq!(rotator.stats().bytes_dropped, 4);

        fs::create_dir(&base).unwrap();
        rotator.write_at(T + 1, b"kept", 0);
        rotator.finish();

        assert_eq!(read(base.join("rec-20231114_221301-1699999981.ts")), b"kept");
    }

    #[test]
    fn test_older_packet_stays_in_current_file() {
        let dir = tempdir().unwrap();
        let mut rotator = utc_rotator(dir.path(), false);

        rotator.write_at(T + 60, b"now", 0);
        rotator.write_at(T + 10, b"-late", 0);
        rotator.finish();

        assert_eq!(rotator.stats().files_created, 1);
        assert_eq!(read(dir.path().join("rec-20231114_221400-1700000040.ts")), b"now-late");
    }

    #[test]
    fn test_unlinked_file_keeps_top_level_name() {
        let dir = tempdir().unwrap();
        // A plain file where the year directory should go
        fs::write(dir.path().join("2023"), b"").unwrap();
        let mut rotator = utc_rotator(dir.path(), true);

        rotator.write_at(T, b"precious", 0);
        rotator.write_at(T + 60, b"next", 0);
        rotator.finish();

        assert_eq!(rotator.stats().files_created, 2);
        assert_eq!(read(dir.path().join("rec-20231114_221300-1699999980.ts")), b"precious");
        assert_eq!(read(dir.path().join("rec-20231114_221400-1700000040.ts")), b"next");
    }

    #[test]
    fn test_failed_open_never_rotates_back() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("rec-20231114_221300-1699999980.ts");
        let blocked = dir.path().join("rec-20231114_221400-1700000040.ts");
        let mut rotator = utc_rotator(dir.path(), false);

        rotator.write_at(T, b"window0-data", 0);
        fs::create_dir(&blocked).unwrap();
        rotator.write_at(T + 60, b"lost", 0);
        assert!(!rotator.is_open());
        assert_eq!(rotator.window_start(), Some(T + 60));

        // Clock stepped back into the finished window
        rotator.write_at(T + 10, b"late", 0);
        assert_eq!(rotator.stats().open_failures, 1);
        assert_eq!(rotator.stats().bytes_dropped, 8);
        assert_eq!(read(&first), b"window0-data");

        fs::remove_dir(&blocked).unwrap();
        rotator.write_at(T + 61, b"retry", 0);
        rotator.finish();

        assert_eq!(read(&first), b"window0-data");
        assert_eq!(read(&blocked), b"retry");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_write_failure_is_counted_and_not_fatal() {
        let full = Path::new("/dev/full");
        if !full.exists() {
            return;
        }
        let dir = tempdir().unwrap();
        std::os::unix::fs::symlink(full, dir.path().join("rec-20231114_221300-1699999980.ts"))
            .unwrap();
        let mut rotator = utc_rotator(dir.path(), false);

        rotator.write_at(T, b"no space", 0);
        assert!(rotator.is_open());
        assert_eq!(rotator.stats().write_failures, 1);
        assert_eq!(rotator.stats().bytes_written, 0);

        rotator.write_at(T + 60, b"written", 0);
        rotator.finish();

        assert_eq!(rotator.stats().write_failures, 1);
        assert_eq!(rotator.stats().bytes_written, 7);
        assert_eq!(read(dir.path().join("rec-20231114_221400-1700000040.ts")), b"written");
    }

    struct FailingWriter {
        accept: usize,
    }

    impl Write for FailingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.accept == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            let n = buf.len().min(self.accept).min(2);
            self.accept -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_counted_reports_short_write() {
        let mut writer = FailingWriter { accept: 3 };
        let (written, err) = write_counted(&mut writer, b"abcdef");

        assert_eq!(written, 3);
        assert_eq!(err.unwrap().to_string(), "disk full");

        let mut ok = Vec::new();
        let (written, err) = write_counted(&mut ok, b"abcdef");
        assert_eq!(written, 6);
        assert!(err.is_none());
    }
}
