use super::{ActivityLog, LogRecord};
use anyhow::{anyhow, bail, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// JSON-lines activity log on local disk.
///
/// The file is opened in append mode and exclusively locked for as long as the
/// value lives, so a second process pointed at the same path fails at open.
#[derive(Debug)]
pub struct FileActivityLog {
    path: PathBuf,
    writer: Mutex<File>,
}

impl FileActivityLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open activity log {}", path.display()))?;

        FileExt::try_lock_exclusive(&file).with_context(|| {
            format!(
                "activity log {} is locked; is another instance running?",
                path.display()
            )
        })?;

        repair_tail(&mut file)
            .with_context(|| format!("failed to repair activity log {}", path.display()))?;

        tracing::debug!(path = %path.display(), "activity log opened");
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ActivityLog for FileActivityLog {
    fn append(&self, record: &LogRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record).context("failed to encode log record")?;
        line.push(b'\n');

        let mut file = self
            .writer
            .lock()
            .map_err(|_| anyhow!("activity log writer lock poisoned"))?;
        file.write_all(&line)
            .with_context(|| format!("failed to append to {}", self.path.display()))
    }

    fn read_all(&self) -> Result<Vec<LogRecord>> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read activity log {}", self.path.display()))?;
        parse_records(&content)
    }
}

/// Makes sure the next append starts on a fresh line. A complete record that
/// lost only its newline is terminated; torn bytes after the last newline are
/// cut off.
fn repair_tail(file: &mut File) -> Result<()> {
    let mut content = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut content)?;
    if content.is_empty() || content.ends_with(b"\n") {
        return Ok(());
    }

    let keep = content
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map_or(0, |position| position + 1);
    let tail = &content[keep..];

    if serde_json::from_slice::<LogRecord>(tail).is_ok() {
        tracing::warn!("terminating unterminated final activity log record");
        file.write_all(b"\n")?;
    } else {
        tracing::warn!(
            offset = keep,
            discarded = tail.len(),
            "truncating torn final activity log line"
        );
        file.set_len(keep as u64)?;
    }
    file.sync_data()?;
    Ok(())
}

/// Parses newline-delimited records. A damaged final line is the footprint of
/// an append interrupted by a crash and is dropped; damage anywhere else is an
/// error.
pub(crate) fn parse_records(content: &str) -> Result<Vec<LogRecord>> {
    let lines: Vec<(usize, &str)> = content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .collect();

    let mut records = Vec::with_capacity(lines.len());
    for (position, (index, line)) in lines.iter().enumerate() {
        match serde_json::from_str::<LogRecord>(line) {
            Ok(record) => records.push(record),
            Err(err) if position + 1 == lines.len() => {
                tracing::warn!(
                    line = index + 1,
                    error = %err,
                    "ignoring torn final activity log line"
                );
            }
            Err(err) => bail!("malformed activity log record at line {}: {err}", index + 1),
        }
    }

    Ok(records)
}
