//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use powerpulse_msg::{FinishedSample, SourceKind};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{PersistenceError, Result};

/// On-disk format version written into every log header.
pub const SAMPLE_LOG_VERSION: u16 = 1;

/// Header stored as the first line of every sample log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SampleLogHeader {
    version: u16,
    created_at: DateTime<Utc>,
    source: SourceKind,
}

impl SampleLogHeader {
    fn new(source: SourceKind) -> Self {
        Self {
            version: SAMPLE_LOG_VERSION,
            created_at: Utc::now(),
            source,
        }
    }
}

/// One persisted sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleLogEntry {
    /// Sequential identifier assigned when appending.
    pub sequence: u64,
    /// Time the entry was written.
    pub recorded_at: DateTime<Utc>,
    /// The finished sample.
    pub sample: FinishedSample,
}

/// Append-only writer for one source's sample log.
pub struct SampleLogWriter {
    file: File,
    next_sequence: u64,
    torn_tail: bool,
}

impl SampleLogWriter {
    /// Open a log for appending, writing a header if the file is new or empty.
    pub fn open(path: &Path, source: SourceKind) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let fresh = !path.exists() || fs::metadata(path)?.len() == 0;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        if fresh {
            let mut line = serde_json::to_vec(&SampleLogHeader::new(source))?;
            line.push(b'\n');
            file.write_all(&line)?;
            return Ok(Self {
                file,
                next_sequence: 0,
                torn_tail: false,
            });
        }

        check_header(path)?;
        let next_sequence = determine_last_sequence(path)?;
        let torn_tail = !ends_with_newline(path)?;
        if torn_tail {
            warn!(path = %path.display(), "sample log ends mid-line; next entry starts on a fresh line");
        }
        Ok(Self {
            file,
            next_sequence,
            torn_tail,
        })
    }

    /// Append a sample and return the assigned sequence number and byte count.
    ///
    /// Each entry goes out in a single write. After a failed write the next
    /// entry is preceded by a newline so a partial line never swallows it.
    pub fn append(&mut self, sample: &FinishedSample) -> Result<(u64, usize)> {
        let entry = SampleLogEntry {
            sequence: self.next_sequence + 1,
            recorded_at: Utc::now(),
            sample: sample.clone(),
        };
        let mut line = Vec::new();
        if self.torn_tail {
            line.push(b'\n');
        }
        serde_json::to_writer(&mut line, &entry)?;
        line.push(b'\n');

        if let Err(err) = self.file.write_all(&line) {
            self.torn_tail = true;
            return Err(err.into());
        }
        self.torn_tail = false;
        self.next_sequence = entry.sequence;
        Ok((entry.sequence, line.len()))
    }
}

fn ends_with_newline(path: &Path) -> Result<bool> {
    let mut file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn check_header(path: &Path) -> Result<()> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut first_line = String::new();
    reader.read_line(&mut first_line)?;
    let header: SampleLogHeader = serde_json::from_str(first_line.trim())?;
    if header.version != SAMPLE_LOG_VERSION {
        return Err(PersistenceError::UnsupportedVersion {
            found: header.version,
            expected: SAMPLE_LOG_VERSION,
        });
    }
    Ok(())
}

fn determine_last_sequence(path: &Path) -> Result<u64> {
    let mut last_seq = 0u64;
    for entry in SampleLogReader::open(path)? {
        match entry {
            Ok(entry) => last_seq = entry.sequence,
            // Unreadable lines do not carry a sequence.
            Err(PersistenceError::Json(_)) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(last_seq)
}

/// Replay the log in order, invoking the callback for each entry.
pub fn replay<F>(path: &Path, mut handler: F) -> Result<usize>
where
    F: FnMut(SampleLogEntry) -> Result<()>,
{
    let mut count = 0usize;
    for entry in SampleLogReader::open(path)? {
        handler(entry?)?;
        count += 1;
    }
    Ok(count)
}

/// Streaming iterator over the entries of a sample log.
pub struct SampleLogReader {
    lines: std::io::Lines<BufReader<File>>,
}

impl SampleLogReader {
    /// Open the log for sequential reading, skipping the header.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut first_line = String::new();
        reader.read_line(&mut first_line)?;
        Ok(Self {
            lines: reader.lines(),
        })
    }
}

impl Iterator for SampleLogReader {
    type Item = Result<SampleLogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.lines.next()? {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => return Some(serde_json::from_str(&line).map_err(PersistenceError::from)),
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}
