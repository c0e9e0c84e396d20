//! Bounded log tail reads.
//!
//! Every poll re-reads the last `max_bytes` of the log instead of keeping a
//! cursor, which keeps truncation and rotation harmless at the cost of
//! re-parsing the overlap.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// A suffix of the log, starting on a line boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogTail {
    pub text: String,
    /// Absolute byte offset the read started at (before partial-line trimming).
    pub start_offset: u64,
    /// File length observed by this read.
    pub file_len: u64,
}

/// Read at most `max_bytes` from the end of `path`, never before `floor`.
///
/// `floor` is the offset where the current run's output begins. If the file is
/// now shorter than `floor` it was truncated or rotated and the floor is
/// ignored. When the read starts past the floor, the first line is partial
/// and is dropped. A missing file yields an empty tail.
pub fn read_tail(path: &Path, max_bytes: u64, floor: u64) -> std::io::Result<LogTail> {
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LogTail::default()),
        Err(e) => return Err(e),
    };
    let file_len = file.metadata()?.len();
    let floor = if file_len < floor { 0 } else { floor };

    let start = file_len.saturating_sub(max_bytes).max(floor);
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::with_capacity((file_len - start) as usize);
    file.take(file_len - start).read_to_end(&mut buf)?;

    let mut text = String::from_utf8_lossy(&buf).into_owned();
    if start > floor {
        text = match text.find('\n') {
            Some(idx) => text[idx + 1..].to_string(),
            None => String::new(),
        };
    }

    Ok(LogTail {
        text,
        start_offset: start,
        file_len,
    })
}
