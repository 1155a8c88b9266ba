//! Input files and line-count estimation.

use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

use memchr::memchr_iter;

/// Number of bytes the estimator scans before giving up on an exact count.
const SAMPLE_BYTES: u64 = 1024 * 1024;

/// Number of lines the estimator scans before giving up on an exact count.
const SAMPLE_LINES: u64 = 10_000;

/// Line-count estimate of a single file.
///
/// The estimate is exact when the scan reached end of file within the sample
/// window, approximate otherwise. An approximate estimate carries the average
/// terminated-line length observed in the sample; the estimated count is the
/// file size divided by that average.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LineEstimate {
    Exact(u64),
    Approximate { avg_line_bytes: f64 },
}

impl LineEstimate {
    /// Estimated number of lines of a file of `file_size` bytes.
    ///
    /// A zero average collapses to one line, the defined fallback for
    /// empty-average measurements.
    pub fn lines(&self, file_size: u64) -> f64 {
        match *self {
            LineEstimate::Exact(count) => count as f64,
            LineEstimate::Approximate { avg_line_bytes } => {
                if avg_line_bytes == 0.0 {
                    1.0
                } else {
                    file_size as f64 / avg_line_bytes
                }
            }
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, LineEstimate::Exact(_))
    }
}

/// An input file resolved at startup: path, byte size and line-count
/// estimate. Read-only once created.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub path: PathBuf,
    pub size: u64,
    pub lines: LineEstimate,
}

impl InputFile {
    /// Resolves a path into an input file, scanning a prefix of it for the
    /// line-count estimate.
    pub fn stat(path: &Path) -> io::Result<InputFile> {
        let size = fs::metadata(path)?.len();
        let lines = stat_lines(path)?;

        return Ok(InputFile {
            path: path.to_path_buf(),
            size,
            lines,
        });
    }

    pub fn estimated_lines(&self) -> f64 {
        self.lines.lines(self.size)
    }
}

/// Scans a prefix of the file and classifies its line count.
///
/// Reaching end of file within the sample window yields an exact count, with
/// an unterminated final line counting as a line. Otherwise the observed
/// average terminated-line length is reported for approximation.
pub fn stat_lines(path: &Path) -> io::Result<LineEstimate> {
    let file = fs::File::open(path)?;
    let mut reader = io::BufReader::new(file);

    let mut scanned = 0u64;
    let mut lines = 0u64;
    // bytes up to and including the last seen terminator
    let mut terminated_bytes = 0u64;
    let mut ends_terminated = true;

    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            if !ends_terminated {
                lines += 1;
            }
            return Ok(LineEstimate::Exact(lines));
        }

        for pos in memchr_iter(b'\n', buf) {
            lines += 1;
            terminated_bytes = scanned + pos as u64 + 1;
        }
        ends_terminated = buf[buf.len() - 1] == b'\n';

        let consumed = buf.len();
        scanned += consumed as u64;
        reader.consume(consumed);

        if scanned >= SAMPLE_BYTES || lines >= SAMPLE_LINES {
            break;
        }
    }

    let avg_line_bytes = if lines == 0 {
        0.0
    } else {
        terminated_bytes as f64 / lines as f64
    };

    return Ok(LineEstimate::Approximate { avg_line_bytes });
}
