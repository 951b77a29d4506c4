//! Line-oriented output sinks.
//!
//! An [`OutputSink`] serializes whole-line writes behind a mutex so that the
//! message path and the status path can share it without tearing lines, and
//! flushes after every line. A header (CSV) is written lazily in front of the
//! first line, never at creation.

use crate::config::OutputDestination;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

enum Writer {
    Open(Box<dyn Write + Send>),
    /// File not created yet
    Deferred(PathBuf),
}

struct SinkState {
    writer: Writer,
    /// Pending header; cleared once it has been written
    header: Option<String>,
    lines: u64,
}

impl SinkState {
    fn writer(&mut self) -> io::Result<&mut Box<dyn Write + Send>> {
        if let Writer::Deferred(path) = &self.writer {
            let file = File::create(path)?;
            self.writer = Writer::Open(Box::new(file));
        }
        match &mut self.writer {
            Writer::Open(writer) => Ok(writer),
            Writer::Deferred(path) => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} was not opened", path.display()),
            )),
        }
    }
}

/// Synchronized, flush-on-write line sink.
pub struct OutputSink {
    state: Mutex<SinkState>,
}

impl OutputSink {
    fn with_writer(writer: Writer) -> Self {
        Self {
            state: Mutex::new(SinkState {
                writer,
                header: None,
                lines: 0,
            }),
        }
    }

    /// Wrap any writer.
    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self::with_writer(Writer::Open(Box::new(writer)))
    }

    /// Process standard output.
    pub fn stdout() -> Self {
        Self::from_writer(io::stdout())
    }

    /// Process standard error (the diagnostic stream).
    pub fn stderr() -> Self {
        Self::from_writer(io::stderr())
    }

    /// Create (or truncate) a file. Output is UTF-8 without a byte-order mark.
    pub fn create_file(path: &Path) -> io::Result<Self> {
        Ok(Self::from_writer(File::create(path)?))
    }

    /// File sink that leaves `path` untouched until [`prepare`](Self::prepare)
    /// or the first line.
    pub fn deferred_file(path: impl Into<PathBuf>) -> Self {
        Self::with_writer(Writer::Deferred(path.into()))
    }

    /// The sink a session destination describes. Files are deferred.
    pub fn open(destination: &OutputDestination) -> Self {
        match destination {
            OutputDestination::Stdout => Self::stdout(),
            OutputDestination::File(path) => Self::deferred_file(path.clone()),
        }
    }

    /// Create a deferred file now. No-op for every other sink.
    pub fn prepare(&self) -> io::Result<()> {
        self.state.lock().writer().map(|_| ())
    }

    /// Reserve a header line emitted once, right before the first data line.
    pub fn with_header(self, header: Option<&str>) -> Self {
        self.state.lock().header = header.map(str::to_owned);
        self
    }

    /// Write one line (newline appended) and flush.
    ///
    /// A pending header stays pending until it has been written successfully.
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        let mut state = self.state.lock();
        if let Some(header) = state.header.clone() {
            writeln!(state.writer()?, "{}", header)?;
            state.header = None;
        }
        let writer = state.writer()?;
        writeln!(writer, "{}", line)?;
        writer.flush()?;
        state.lines += 1;
        Ok(())
    }

    /// Number of data lines written so far (header excluded).
    pub fn lines_written(&self) -> u64 {
        self.state.lock().lines
    }

    /// Flush the underlying writer. A deferred file stays deferred.
    pub fn flush(&self) -> io::Result<()> {
        match &mut self.state.lock().writer {
            Writer::Open(writer) => writer.flush(),
            Writer::Deferred(_) => Ok(()),
        }
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSink")
            .field("lines", &self.lines_written())
            .finish_non_exhaustive()
    }
}

/// Cloneable in-memory writer, handy for capturing sink output.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, decoded lossily as UTF-8.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    /// Written lines, without terminators.
    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_owned).collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn header_is_lazy() {
        let buffer = SharedBuffer::new();
        let sink = OutputSink::from_writer(buffer.clone()).with_header(Some("a,b"));
        assert_eq!(buffer.contents(), "");

        sink.write_line("1,2").unwrap();
        sink.write_line("3,4").unwrap();
        assert_eq!(buffer.lines(), vec!["a,b", "1,2", "3,4"]);
        assert_eq!(sink.lines_written(), 2);
    }

    #[test]
    fn no_header_without_rows() {
        let buffer = SharedBuffer::new();
        let sink = OutputSink::from_writer(buffer.clone()).with_header(Some("a,b"));
        sink.flush().unwrap();
        assert_eq!(buffer.contents(), "");
        assert_eq!(sink.lines_written(), 0);
    }

    #[test]
    fn concurrent_writers_never_tear_lines() {
        let buffer = SharedBuffer::new();
        let sink = Arc::new(OutputSink::from_writer(buffer.clone()).with_header(Some("hdr")));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let sink = sink.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        sink.write_line(&format!("{}-{}", t, i)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let lines = buffer.lines();
        assert_eq!(lines.len(), 401);
        assert_eq!(lines[0], "hdr");
        assert_eq!(lines.iter().filter(|l| l.as_str() == "hdr").count(), 1);
        assert!(lines[1..].iter().all(|l| l.split('-').count() == 2));
    }

    #[test]
    fn file_sink_truncates_and_writes_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        std::fs::write(&path, "stale content\n").unwrap();

        let sink = OutputSink::open(&OutputDestination::File(path.clone()))
            .with_header(Some("timestamp,analog_values,digital_hex"));
        sink.write_line("42,1.000000,").unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_ne!(&bytes[..3], &[0xEF, 0xBB, 0xBF]);
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "timestamp,analog_values,digital_hex\n42,1.000000,\n"
        );
    }

    #[test]
    fn deferred_file_is_untouched_until_prepared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        std::fs::write(&path, "previous run\n").unwrap();

        let sink = OutputSink::open(&OutputDestination::File(path.clone()));
        sink.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "previous run\n");

        sink.prepare().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    /// Writer whose first write fails.
    struct FailOnce {
        failed: bool,
        buffer: SharedBuffer,
    }

    impl Write for FailOnce {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if !self.failed {
                self.failed = true;
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            self.buffer.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn header_survives_failed_write() {
        let buffer = SharedBuffer::new();
        let sink = OutputSink::from_writer(FailOnce {
            failed: false,
            buffer: buffer.clone(),
        })
        .with_header(Some("hdr"));

        assert!(sink.write_line("1").is_err());
        sink.write_line("2").unwrap();

        assert_eq!(buffer.lines(), vec!["hdr", "2"]);
        assert_eq!(sink.lines_written(), 1);
    }
}
