//! Follows a growing server log file.
//!
//! Only complete lines are returned: a trailing line still being written
//! stays unread until its newline arrives. Rotation is detected by inode
//! change or truncation.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Upper bound of lines returned by one `read_lines()` call.
const MAX_LINES_PER_READ: usize = 10_000;

pub struct LogTailer {
    path: PathBuf,
    offset: u64,
    inode: u64,
}

impl LogTailer {
    /// Starts at the current end of `path`; existing content is skipped.
    pub fn from_end(path: PathBuf) -> io::Result<Self> {
        let metadata = fs::metadata(&path)?;
        Ok(Self {
            inode: inode_of(&metadata),
            offset: metadata.len(),
            path,
        })
    }

    /// Starts at the beginning of `path`.
    pub fn from_start(path: PathBuf) -> io::Result<Self> {
        let metadata = fs::metadata(&path)?;
        Ok(Self {
            inode: inode_of(&metadata),
            offset: 0,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns complete lines appended since the previous call, without
    /// their line terminators. Invalid UTF-8 is replaced.
    ///
    /// A missing file yields no lines; the next call tries again.
    pub fn read_lines(&mut self) -> io::Result<Vec<String>> {
        let metadata = match fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let inode = inode_of(&metadata);
        if inode != self.inode || metadata.len() < self.offset {
            self.inode = inode;
            self.offset = 0;
        }
        if metadata.len() <= self.offset {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut reader = BufReader::new(file);

        let mut lines = Vec::new();
        let mut buf = Vec::new();
        while lines.len() < MAX_LINES_PER_READ {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf)?;
            if read == 0 || buf.last() != Some(&b'\n') {
                break;
            }
            self.offset += read as u64;

            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            lines.push(String::from_utf8_lossy(&buf).into_owned());
        }

        Ok(lines)
    }
}

#[cfg(unix)]
fn inode_of(metadata: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn inode_of(_metadata: &fs::Metadata) -> u64 {
    0
}
