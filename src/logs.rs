//! Log engine: per-service log files, rotation, flushing, and tailing.
//!
//! Each service writes either a `{name}-out.log` / `{name}-error.log` pair or,
//! with `merge_logs`, a single `{name}.log` shared by both streams. Files are
//! append-only while the service runs; the supervisor only ever rotates them
//! on start, truncates them on flush, and reads them for tailing.
use std::{
    collections::{HashMap, HashSet},
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{OnceLock, atomic::AtomicBool, atomic::Ordering},
    thread,
    time::Duration,
};

use chrono::Local;
use regex::Regex;
use strum_macros::{AsRefStr, EnumString};
use tracing::warn;

use crate::error::LogsManagerError;

/// Maximum number of rotated files kept per log; older rotations are dropped.
pub const ROTATE_CAP: usize = 30;

/// Block size for the reverse tail read.
const TAIL_CHUNK_SIZE: u64 = 8192;

/// Sleep between polls when no followed file produced new data.
const FOLLOW_IDLE_SLEEP: Duration = Duration::from_millis(50);

/// Which stream a log file carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Both streams interleaved into one file.
    Merged,
}

/// A log file selected for tailing.
#[derive(Debug, Clone)]
pub struct TailTarget {
    /// Row id of the owning service, for display disambiguation.
    pub id: usize,
    /// Owning service name.
    pub service: String,
    /// Stream this file carries.
    pub stream: LogStream,
    /// Path to the current (non-rotated) log file.
    pub path: PathBuf,
}

/// One emitted tail line, tagged for interleaved display.
#[derive(Debug, Clone)]
pub struct TaggedLine {
    pub id: usize,
    pub service: String,
    pub stream: LogStream,
    /// Timestamp parsed out of the line, or wall-clock time when absent.
    pub timestamp: String,
    pub message: String,
}

/// Totals returned by [`LogManager::flush_logs`].
#[derive(Debug, Default, Clone)]
pub struct FlushSummary {
    /// Files removed outright (stopped services and rotated backups).
    pub deleted: usize,
    /// Current files truncated in place because their service is running.
    pub cleared: usize,
    /// Per-service `(deleted, cleared)` breakdown.
    pub per_service: HashMap<String, (usize, usize)>,
}

fn timestamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\d{4}-\d{2}-\d{2}\s\d{2}:\d{2}:\d{2}").expect("valid regex")
    })
}

/// Splits a log line into `(timestamp, message)`, synthesizing the timestamp
/// from the wall clock when the line does not carry one.
pub fn parse_log_line(line: &str) -> (String, String) {
    let content = line.trim_end();

    if let Some(found) = timestamp_re().find(content) {
        let timestamp = found.as_str().to_string();
        let message = content.replacen(found.as_str(), "", 1).trim().to_string();
        (timestamp, message)
    } else {
        (
            Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            content.to_string(),
        )
    }
}

/// Manages the log directory for one host.
#[derive(Debug, Clone)]
pub struct LogManager {
    log_dir: PathBuf,
}

impl LogManager {
    /// Creates a manager rooted at the given log directory.
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    /// Current (non-rotated) log files for a service, keyed by stream.
    pub fn current_files(&self, service: &str, merge: bool) -> Vec<(LogStream, PathBuf)> {
        if merge {
            vec![(LogStream::Merged, self.log_dir.join(format!("{service}.log")))]
        } else {
            vec![
                (
                    LogStream::Stdout,
                    self.log_dir.join(format!("{service}-out.log")),
                ),
                (
                    LogStream::Stderr,
                    self.log_dir.join(format!("{service}-error.log")),
                ),
            ]
        }
    }

    /// Base file names (current plus rotation prefix) a service may own,
    /// covering both merge modes so flush never orphans a leftover file from a
    /// previous setting.
    fn base_names(service: &str) -> [String; 3] {
        [
            format!("{service}.log"),
            format!("{service}-out.log"),
            format!("{service}-error.log"),
        ]
    }

    /// Rotates the current log files for a service so it starts fresh.
    ///
    /// `current` becomes `.1`, existing `.1..` shift up by one, and anything
    /// past [`ROTATE_CAP`] is discarded.
    pub fn rotate(&self, service: &str, merge: bool) -> std::io::Result<()> {
        for (_, path) in self.current_files(service, merge) {
            rotate_file(&path)?;
        }
        Ok(())
    }

    /// Rotates, then opens fresh append handles and writes a start banner.
    ///
    /// Returns `(stdout, stderr)` handles; in merged mode both refer to the
    /// same underlying file, which gets a single banner.
    pub fn prepare_for_start(
        &self,
        service: &str,
        merge: bool,
    ) -> std::io::Result<(File, File)> {
        fs::create_dir_all(&self.log_dir)?;
        self.rotate(service, merge)?;

        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let banner = format!("--- Starting service '{service}' at {timestamp} ---\n");

        let mut files = Vec::new();
        for (_, path) in self.current_files(service, merge) {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(banner.as_bytes())?;
            files.push(file);
        }

        if merge {
            let out = files.remove(0);
            let err = out.try_clone()?;
            Ok((out, err))
        } else {
            let err = files.remove(1);
            let out = files.remove(0);
            Ok((out, err))
        }
    }

    /// Flushes logs for the given services.
    ///
    /// A running service's *current* file is truncated in place and left with
    /// a flush banner, since the child keeps writing through its existing file
    /// descriptor; deleting it would orphan that descriptor. Everything else
    /// (rotated backups, stopped services' files) is deleted. I/O failures are
    /// reported per file and never abort the batch.
    pub fn flush_logs(
        &self,
        services: &[String],
        running: &HashSet<String>,
    ) -> FlushSummary {
        let mut summary = FlushSummary::default();

        for service in services {
            let mut deleted = 0usize;
            let mut cleared = 0usize;
            let current: HashSet<String> =
                Self::base_names(service).into_iter().collect();

            for path in self.matching_files(service) {
                let file_name = match path.file_name().and_then(|n| n.to_str()) {
                    Some(name) => name.to_string(),
                    None => continue,
                };

                let is_current = current.contains(&file_name);
                let result = if is_current && running.contains(service) {
                    truncate_with_banner(&path).map(|_| cleared += 1)
                } else {
                    fs::remove_file(&path).map(|_| deleted += 1)
                };

                if let Err(err) = result {
                    warn!("Failed to flush {}: {err}", path.display());
                }
            }

            summary.deleted += deleted;
            summary.cleared += cleared;
            summary
                .per_service
                .insert(service.clone(), (deleted, cleared));
        }

        summary
    }

    /// All on-disk files belonging to a service: current logs plus rotated
    /// `.N` siblings, regardless of merge mode.
    fn matching_files(&self, service: &str) -> Vec<PathBuf> {
        let bases = Self::base_names(service);
        let mut matches = Vec::new();

        let entries = match fs::read_dir(&self.log_dir) {
            Ok(entries) => entries,
            Err(_) => return matches,
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };

            let owned = bases.iter().any(|base| {
                name == base
                    || name
                        .strip_prefix(base.as_str())
                        .and_then(|rest| rest.strip_prefix('.'))
                        .is_some_and(|n| n.chars().all(|c| c.is_ascii_digit()))
            });

            if owned {
                matches.push(entry.path());
            }
        }

        matches.sort();
        matches
    }

    /// Resolves tail targets for `(id, name, merge)` triples, warning (not
    /// failing) for each missing file.
    pub fn resolve_targets(&self, services: &[(usize, String, bool)]) -> Vec<TailTarget> {
        let mut targets = Vec::new();

        for (id, service, merge) in services {
            for (stream, path) in self.current_files(service, *merge) {
                if path.exists() {
                    targets.push(TailTarget {
                        id: *id,
                        service: service.clone(),
                        stream,
                        path,
                    });
                } else {
                    warn!("No {} log found for '{service}'", stream.as_ref());
                }
            }
        }

        targets
    }

    /// Emits the last `lines` lines of every target through `sink`.
    pub fn print_recent(
        &self,
        targets: &[TailTarget],
        lines: usize,
        sink: &mut dyn FnMut(TaggedLine),
    ) -> Result<(), LogsManagerError> {
        for target in targets {
            let recent = read_last_lines(&target.path, lines).map_err(|source| {
                LogsManagerError::LogIoError {
                    path: target.path.display().to_string(),
                    source,
                }
            })?;

            for line in recent {
                let (timestamp, message) = parse_log_line(&line);
                sink(TaggedLine {
                    id: target.id,
                    service: target.service.clone(),
                    stream: target.stream,
                    timestamp,
                    message,
                });
            }
        }

        Ok(())
    }

    /// Follows the targets like `tail -f`, interleaving new lines in target
    /// order, until `running` is cleared. Interruption is a clean return.
    pub fn follow(
        &self,
        targets: &[TailTarget],
        running: &AtomicBool,
        sink: &mut dyn FnMut(TaggedLine),
    ) -> Result<(), LogsManagerError> {
        let mut readers = Vec::new();

        for target in targets {
            let mut file =
                File::open(&target.path).map_err(|source| LogsManagerError::LogIoError {
                    path: target.path.display().to_string(),
                    source,
                })?;
            file.seek(SeekFrom::End(0))
                .map_err(|source| LogsManagerError::LogIoError {
                    path: target.path.display().to_string(),
                    source,
                })?;
            readers.push((target.clone(), BufReader::new(file)));
        }

        while running.load(Ordering::SeqCst) {
            let mut had_data = false;
            let mut failed = Vec::new();

            for (index, (target, reader)) in readers.iter_mut().enumerate() {
                let mut line = String::new();
                // Drain whatever accumulated since the last poll.
                loop {
                    match reader.read_line(&mut line) {
                        Ok(0) => break,
                        Ok(_) => {
                            had_data = true;
                            let (timestamp, message) = parse_log_line(&line);
                            sink(TaggedLine {
                                id: target.id,
                                service: target.service.clone(),
                                stream: target.stream,
                                timestamp,
                                message,
                            });
                            line.clear();
                        }
                        Err(err) => {
                            warn!(
                                "Failed to read {}: {err}; no longer following it",
                                target.path.display()
                            );
                            failed.push(index);
                            break;
                        }
                    }
                }
            }

            // A failing file stops being followed; the rest keep going.
            for index in failed.into_iter().rev() {
                readers.remove(index);
            }

            if !had_data {
                thread::sleep(FOLLOW_IDLE_SLEEP);
            }
        }

        Ok(())
    }
}

/// Shifts `path` into numeric-suffix history: `path` → `path.1`, `path.N` →
/// `path.N+1`, dropping anything beyond [`ROTATE_CAP`]. No-op when `path`
/// does not exist.
fn rotate_file(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let oldest = rotated_path(path, ROTATE_CAP);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }

    for index in (1..ROTATE_CAP).rev() {
        let from = rotated_path(path, index);
        if from.exists() {
            fs::rename(&from, rotated_path(path, index + 1))?;
        }
    }

    fs::rename(path, rotated_path(path, 1))
}

fn rotated_path(path: &Path, index: usize) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{index}"));
    path.with_file_name(name)
}

/// Truncates a log file in place, leaving only a flush banner.
fn truncate_with_banner(path: &Path) -> std::io::Result<()> {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    fs::write(path, format!("--- Logs flushed at {timestamp} ---\n"))
}

/// Returns the last `lines` lines of a file without reading it front-to-back.
///
/// Seeks backwards in fixed-size blocks from the end, accumulating until
/// enough newlines are buffered or the file start is reached, then decodes
/// and takes the trailing lines.
pub fn read_last_lines(path: &Path, lines: usize) -> std::io::Result<Vec<String>> {
    if lines == 0 {
        return Ok(Vec::new());
    }

    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let mut pos = len;
    let mut buffer: Vec<u8> = Vec::new();

    while pos > 0 {
        let read_len = TAIL_CHUNK_SIZE.min(pos);
        pos -= read_len;

        let mut chunk = vec![0u8; read_len as usize];
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(&mut chunk)?;

        chunk.extend_from_slice(&buffer);
        buffer = chunk;

        // One extra newline guarantees the earliest buffered line is complete.
        let newlines = buffer.iter().filter(|&&b| b == b'\n').count();
        if newlines > lines {
            break;
        }
    }

    let decoded = String::from_utf8_lossy(&buffer);
    let collected: Vec<String> = decoded.lines().map(|line| line.to_string()).collect();
    let start = collected.len().saturating_sub(lines);
    Ok(collected[start..].to_vec())
}
