//! Program stream readers
//!
//! Readers hand out rows lazily as [`GcodeCommand`]s with comments split off.
//! Before the first row is read a reader can be told to start from a later
//! row; the skipped rows still pass through a [`GcodeParser`] so the modal
//! state they establish is offered as a preamble.

use crate::parser::{strip_comment, GcodeParser};
use gcodestream_core::{GcodeCommand, GcodeError, GcodeStreamReader, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Buffer size for reading large files (256 KB)
const READ_BUFFER_SIZE: usize = 256 * 1024;

/// Build the command for one program row
fn row_command(row: usize, raw: &str) -> GcodeCommand {
    let (code, comment) = strip_comment(raw);
    GcodeCommand::new(code)
        .with_original_text(raw.trim())
        .with_comment(comment)
        .with_line_number(row)
}

/// Bookkeeping shared by every reader
#[derive(Debug, Default)]
struct Cursor {
    total_rows: usize,
    rows_read: usize,
    preamble: Option<String>,
}

impl Cursor {
    /// Validate a start row and return how many rows to skip
    fn check_start(&self, row: usize) -> Result<usize> {
        if self.rows_read > 0 {
            return Err(GcodeError::StreamAlreadyStarted {
                row: self.rows_read,
            }
            .into());
        }
        if row == 0 || row > self.total_rows {
            return Err(GcodeError::RowOutOfRange {
                row,
                total: self.total_rows,
            }
            .into());
        }
        Ok(row - 1)
    }

    /// Feed skipped rows to a modal tracker and record the preamble
    fn skip_rows<'a>(&mut self, rows: impl Iterator<Item = &'a str>) {
        let mut parser = GcodeParser::new();
        for raw in rows {
            if let Err(e) = parser.process(raw) {
                tracing::warn!("Skipped row {} not understood: {}", self.rows_read + 1, e);
            }
            self.rows_read += 1;
        }
        if self.rows_read > 0 {
            self.preamble = Some(parser.preamble());
        }
    }
}

/// Reader over a program held in memory
#[derive(Debug)]
pub struct StringStreamReader {
    rows: Vec<String>,
    cursor: Cursor,
}

impl StringStreamReader {
    /// Create a reader over `program`, one row per line
    pub fn new(program: &str) -> Self {
        let rows: Vec<String> = program.lines().map(str::to_string).collect();
        Self {
            cursor: Cursor {
                total_rows: rows.len(),
                ..Default::default()
            },
            rows,
        }
    }

    /// Start streaming at 1-based `row`; rows before it are not sent.
    ///
    /// Only valid before the first row is read.
    pub fn start_from_row(&mut self, row: usize) -> Result<()> {
        let skip = self.cursor.check_start(row)?;
        let rows = &self.rows;
        self.cursor.skip_rows(rows.iter().take(skip).map(String::as_str));
        Ok(())
    }
}

impl GcodeStreamReader for StringStreamReader {
    fn next_command(&mut self) -> Result<Option<GcodeCommand>> {
        let Some(raw) = self.rows.get(self.cursor.rows_read) else {
            return Ok(None);
        };
        self.cursor.rows_read += 1;
        Ok(Some(row_command(self.cursor.rows_read, raw)))
    }

    fn num_rows(&self) -> usize {
        self.cursor.total_rows
    }

    fn rows_read(&self) -> usize {
        self.cursor.rows_read
    }

    fn preamble(&self) -> Option<String> {
        self.cursor.preamble.clone()
    }
}

/// Reader over a program file, read line by line as rows are requested
pub struct FileStreamReader {
    path: PathBuf,
    reader: BufReader<File>,
    buf: Vec<u8>,
    cursor: Cursor,
}

impl FileStreamReader {
    /// Open `path`, counting its rows up front
    ///
    /// # Errors
    /// Returns a file error if the path is missing, not a file or unreadable
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(GcodeError::FileError {
                reason: format!("Not a readable file: {}", path.display()),
            }
            .into());
        }

        let mut reader = Self::open_reader(&path)?;
        let mut buf = Vec::new();
        let mut total_rows = 0;
        while Self::fill_line(&path, &mut reader, &mut buf)? {
            total_rows += 1;
        }
        let reader = Self::open_reader(&path)?;
        tracing::debug!("Opened {} ({} rows)", path.display(), total_rows);

        Ok(Self {
            path,
            reader,
            buf,
            cursor: Cursor {
                total_rows,
                ..Default::default()
            },
        })
    }

    fn open_reader(path: &Path) -> Result<BufReader<File>> {
        let file = File::open(path).map_err(|e| GcodeError::FileError {
            reason: format!("Failed to open {}: {}", path.display(), e),
        })?;
        Ok(BufReader::with_capacity(READ_BUFFER_SIZE, file))
    }

    /// Read the next raw line into `buf` without its terminator.
    /// Returns false at end of file.
    fn fill_line(path: &Path, reader: &mut BufReader<File>, buf: &mut Vec<u8>) -> Result<bool> {
        buf.clear();
        let n = reader
            .read_until(b'\n', buf)
            .map_err(|e| GcodeError::FileError {
                reason: format!("Failed to read {}: {}", path.display(), e),
            })?;
        if n == 0 {
            return Ok(false);
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        Ok(true)
    }

    /// Program files in the wild carry Latin-1 comments; bytes that are not
    /// UTF-8 become U+FFFD instead of failing the stream.
    fn read_line(&mut self) -> Result<Option<String>> {
        if !Self::fill_line(&self.path, &mut self.reader, &mut self.buf)? {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }

    /// Path of the program
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start streaming at 1-based `row`; rows before it are not sent.
    ///
    /// Only valid before the first row is read.
    pub fn start_from_row(&mut self, row: usize) -> Result<()> {
        let skip = self.cursor.check_start(row)?;
        let mut skipped = Vec::with_capacity(skip);
        for _ in 0..skip {
            match self.read_line()? {
                Some(line) => skipped.push(line),
                None => break,
            }
        }
        self.cursor.skip_rows(skipped.iter().map(String::as_str));
        Ok(())
    }
}

impl GcodeStreamReader for FileStreamReader {
    fn next_command(&mut self) -> Result<Option<GcodeCommand>> {
        let Some(raw) = self.read_line()? else {
            return Ok(None);
        };
        self.cursor.rows_read += 1;
        Ok(Some(row_command(self.cursor.rows_read, &raw)))
    }

    fn num_rows(&self) -> usize {
        self.cursor.total_rows
    }

    fn rows_read(&self) -> usize {
        self.cursor.rows_read
    }

    fn preamble(&self) -> Option<String> {
        self.cursor.preamble.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcodestream_core::ErrorKind;

    const PROGRAM: &str = "G20 G91\n(comment only)\nG1 X1 F10 ; cut\nG0 Z1\n";

    #[test]
    fn test_rows_and_comments() {
        let mut reader = StringStreamReader::new(PROGRAM);
        assert_eq!(reader.num_rows(), 4);

        let first = reader.next_command().unwrap().unwrap();
        assert_eq!(first.text, "G20 G91");
        assert_eq!(first.line_number, Some(1));

        let second = reader.next_command().unwrap().unwrap();
        assert!(second.is_empty());
        assert_eq!(second.comment.as_deref(), Some("comment only"));

        let third = reader.next_command().unwrap().unwrap();
        assert_eq!(third.text, "G1 X1 F10");
        assert_eq!(third.original_text, "G1 X1 F10 ; cut");
        assert_eq!(reader.rows_remaining(), 1);
    }

    #[test]
    fn test_start_from_row_tracks_skipped_modal_state() {
        let mut reader = StringStreamReader::new(PROGRAM);
        reader.start_from_row(4).unwrap();
        assert_eq!(reader.rows_read(), 3);
        assert_eq!(reader.preamble().as_deref(), Some("G20 G91 G17 G94 G54 F10"));

        let next = reader.next_command().unwrap().unwrap();
        assert_eq!(next.text, "G0 Z1");
        assert_eq!(next.line_number, Some(4));
        assert!(reader.next_command().unwrap().is_none());
    }

    #[test]
    fn test_start_from_first_row_has_no_preamble() {
        let mut reader = StringStreamReader::new(PROGRAM);
        reader.start_from_row(1).unwrap();
        assert!(reader.preamble().is_none());
    }

    #[test]
    fn test_start_row_rejected_once_started() {
        let mut reader = StringStreamReader::new(PROGRAM);
        reader.next_command().unwrap();
        let err = reader.start_from_row(3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn test_start_row_out_of_range() {
        let mut reader = StringStreamReader::new(PROGRAM);
        assert!(reader.start_from_row(0).is_err());
        assert!(reader.start_from_row(5).is_err());
    }
}
