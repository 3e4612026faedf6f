use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use coapbench_common::config::LOG_FILE;
use coapbench_common::{BenchError, Result};

use crate::metrics::{PhaseResult, RECORD_HEADER};

/// Destination for phase summaries.
pub trait StatsSink: Send {
    /// Persist the summary of one phase.
    fn emit(&mut self, result: &PhaseResult) -> Result<()>;

    /// Free-form line such as the series announcement.
    fn note(&mut self, line: &str) -> Result<()>;
}

/// `coapbench.log`, or `coapbench_<name>.log` for a named run.
pub fn log_file_name(name: Option<&str>) -> String {
    match name {
        Some(name) => format!("{LOG_FILE}_{name}.log"),
        None => format!("{LOG_FILE}.log"),
    }
}

/// Appends one line per phase to a text file, optionally echoing to stdout.
pub struct LogFileSink {
    path: PathBuf,
    writer: BufWriter<File>,
    echo: bool,
}

impl LogFileSink {
    /// Open (or create) `path` for appending and write the column header.
    pub fn create(path: impl AsRef<Path>, echo: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| BenchError::Sink(format!("{}: {e}", path.display())))?;
        let mut sink = Self { path, writer: BufWriter::new(file), echo };
        sink.write_line(RECORD_HEADER)?;
        Ok(sink)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        if self.echo {
            println!("{line}");
        }
        writeln!(self.writer, "{line}")
            .and_then(|_| self.writer.flush())
            .map_err(|e| BenchError::Sink(format!("{}: {e}", self.path.display())))
    }
}

impl StatsSink for LogFileSink {
    fn emit(&mut self, result: &PhaseResult) -> Result<()> {
        self.write_line(&result.to_string())
    }

    fn note(&mut self, line: &str) -> Result<()> {
        self.write_line(line)
    }
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub results: Vec<PhaseResult>,
    pub lines: Vec<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatsSink for MemorySink {
    fn emit(&mut self, result: &PhaseResult) -> Result<()> {
        self.lines.push(result.to_string());
        self.results.push(result.clone());
        Ok(())
    }

    fn note(&mut self, line: &str) -> Result<()> {
        self.lines.push(line.to_string());
        Ok(())
    }
}

impl<S: StatsSink + ?Sized> StatsSink for Box<S> {
    fn emit(&mut self, result: &PhaseResult) -> Result<()> {
        (**self).emit(result)
    }

    fn note(&mut self, line: &str) -> Result<()> {
        (**self).note(line)
    }
}
