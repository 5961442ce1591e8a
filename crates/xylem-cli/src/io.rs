//! NDJSON input and output.
//!
//! Each line holds one `{"key": ..., "value": ...}` record. Blank lines are
//! skipped. `-` stands for stdin or stdout.

use serde_json::Value;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use xylem::{Output, OutputError, OutputFactory, ReadError, Reader, Record};

/// Reads one record per line.
pub struct NdjsonReader<R> {
    input: R,
    buf: String,
    line: usize,
    current: Option<Record<String, Value>>,
}

impl<R: BufRead> NdjsonReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            buf: String::new(),
            line: 0,
            current: None,
        }
    }
}

/// Open `path` for reading, or stdin for `-` or no path.
pub fn open_input(path: Option<&str>) -> io::Result<NdjsonReader<Box<dyn BufRead>>> {
    let input: Box<dyn BufRead> = match path {
        None | Some("-") => Box::new(BufReader::new(io::stdin())),
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
    };
    Ok(NdjsonReader::new(input))
}

impl<R: BufRead> Reader for NdjsonReader<R> {
    type Key = String;
    type Value = Value;

    fn advance(&mut self) -> Result<bool, ReadError> {
        loop {
            self.buf.clear();
            if self.input.read_line(&mut self.buf)? == 0 {
                self.current = None;
                return Ok(false);
            }
            self.line += 1;

            let text = self.buf.trim();
            if text.is_empty() {
                continue;
            }

            let record = serde_json::from_str(text).map_err(|e| ReadError::Parse {
                line: self.line,
                message: e.to_string(),
            })?;
            self.current = Some(record);
            return Ok(true);
        }
    }

    fn current_key(&self) -> Option<&String> {
        self.current.as_ref().map(|r| &r.key)
    }

    fn current_value(&self) -> Option<&Value> {
        self.current.as_ref().map(|r| &r.value)
    }

    fn close(&mut self) -> Result<(), ReadError> {
        tracing::debug!(lines = self.line, "input closed");
        self.current = None;
        Ok(())
    }
}

/// Where records end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Stdout,
    File(PathBuf),
}

impl Destination {
    pub fn parse(path: Option<&str>) -> Self {
        match path {
            None | Some("-") => Destination::Stdout,
            Some(path) => Destination::File(PathBuf::from(path)),
        }
    }
}

type SharedWriter = Arc<Mutex<Option<Box<dyn Write + Send>>>>;

/// Output writing one JSON line per record. Safe to share across workers.
#[derive(Clone)]
pub struct NdjsonOutput {
    writer: SharedWriter,
}

impl Output<String, Value> for NdjsonOutput {
    fn write(&self, key: String, value: Value) -> Result<(), OutputError> {
        let line = serde_json::to_string(&Record::new(key, value))
            .map_err(|e| OutputError::Serialize(e.to_string()))?;

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let writer = writer.as_mut().ok_or(OutputError::Closed)?;
        writeln!(writer, "{line}")?;
        Ok(())
    }
}

/// Writes a run's records to a destination, committing on success.
///
/// Files are written to a `.partial` sibling and renamed into place on
/// `close(true)`; `close(false)` deletes the partial file. Records sent to
/// stdout cannot be taken back, so closing only flushes.
pub struct NdjsonOutputFactory {
    destination: Destination,
    writer: SharedWriter,
}

impl NdjsonOutputFactory {
    pub fn create(destination: Destination) -> io::Result<Self> {
        let writer: Box<dyn Write + Send> = match &destination {
            Destination::Stdout => Box::new(BufWriter::new(io::stdout())),
            Destination::File(path) => Box::new(BufWriter::new(File::create(staging_path(path))?)),
        };

        Ok(Self {
            destination,
            writer: Arc::new(Mutex::new(Some(writer))),
        })
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

impl OutputFactory<String, Value> for NdjsonOutputFactory {
    type Output = NdjsonOutput;

    fn new_output(&self) -> Result<NdjsonOutput, OutputError> {
        Ok(NdjsonOutput {
            writer: Arc::clone(&self.writer),
        })
    }

    fn new_instance(&self) -> Result<Self, OutputError> {
        Self::create(self.destination.clone()).map_err(OutputError::from)
    }

    fn close(&self, success: bool) -> Result<(), OutputError> {
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut writer) = writer else {
            return Ok(());
        };

        let flushed = writer.flush();
        drop(writer);

        let Destination::File(path) = &self.destination else {
            return flushed.map_err(OutputError::from);
        };
        let staging = staging_path(path);

        if success {
            flushed?;
            fs::rename(&staging, path)?;
            tracing::debug!(path = %path.display(), "output committed");
        } else {
            fs::remove_file(&staging)?;
            tracing::debug!(path = %path.display(), "output discarded");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    fn read_all(text: &str) -> Result<Vec<(String, Value)>, ReadError> {
        let mut reader = NdjsonReader::new(Cursor::new(text.to_string()));
        let mut records = Vec::new();
        while reader.advance()? {
            let key = reader.current_key().unwrap().clone();
            let value = reader.current_value().unwrap().clone();
            records.push((key, value));
        }
        reader.close()?;
        Ok(records)
    }

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("xylem-io-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn test_reader_skips_blank_lines() {
        let text = "{\"key\":\"a\",\"value\":1}\n\n{\"key\":\"b\",\"value\":[2]}\n";
        let records = read_all(text).unwrap();
        assert_eq!(
            records,
            vec![("a".into(), json!(1)), ("b".into(), json!([2]))]
        );
    }

    #[test]
    fn test_reader_reports_line_of_bad_record() {
        let err = read_all("{\"key\":\"a\",\"value\":1}\n{\"key\":\n").unwrap_err();
        assert!(matches!(err, ReadError::Parse { line: 2, .. }));
    }

    #[test]
    fn test_commit_renames_partial_file() {
        let path = scratch("commit.ndjson");
        let factory = NdjsonOutputFactory::create(Destination::File(path.clone())).unwrap();

        factory.new_output().unwrap().write("a".into(), json!(1)).unwrap();
        assert!(staging_path(&path).exists());
        assert!(!path.exists());

        factory.close(true).unwrap();
        assert!(!staging_path(&path).exists());
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"key\":\"a\",\"value\":1}\n");

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_discard_removes_partial_file() {
        let path = scratch("discard.ndjson");
        let factory = NdjsonOutputFactory::create(Destination::File(path.clone())).unwrap();
        let output = factory.new_output().unwrap();

        output.write("a".into(), json!(1)).unwrap();
        factory.close(false).unwrap();

        assert!(!staging_path(&path).exists());
        assert!(!path.exists());
        assert!(matches!(output.write("b".into(), json!(2)), Err(OutputError::Closed)));
    }

    #[test]
    fn test_destination_parse() {
        assert_eq!(Destination::parse(None), Destination::Stdout);
        assert_eq!(Destination::parse(Some("-")), Destination::Stdout);
        assert_eq!(
            Destination::parse(Some("out.ndjson")),
            Destination::File(PathBuf::from("out.ndjson"))
        );
    }
}
