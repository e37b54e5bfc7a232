//! Named text logs kept by the scheduler components.
//!
//! The scheduler, its listener server, every task and every job write a
//! human readable transcript of what they do. That transcript is what ends up
//! attached to alert e-mails and saved in the log store, so it is kept apart
//! from the structured `tracing` output (each line is still mirrored there at
//! `trace` level).

use std::{
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom, Write},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use time::{OffsetDateTime, format_description::BorrowedFormatItem, macros::format_description};
use tracing::{trace, warn};

const FILE_STAMP: &[BorrowedFormatItem<'static>] =
    format_description!("[year][month][day]-[hour][minute][second]");
const LINE_STAMP: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

const FOOTER: &str = "---------------- End of the log file ----------------\n";

/// Below this, a size limit given to [`OutStream::dump`] is raised to it.
const MIN_DUMP: usize = 100;

enum Sink {
    Closed,
    Memory(String),
    File(File),
}

#[derive(Default)]
struct Inner {
    name: String,
    template: Option<String>,
    path: Option<PathBuf>,
    sink: Option<Sink>,
}

/// Shared handle on a named log. Clones write to the same log.
#[derive(Clone, Default)]
pub struct OutStream {
    inner: Arc<Mutex<Inner>>,
}

impl OutStream {
    /// A stream that keeps its content in memory.
    pub fn memory(name: impl Into<String>) -> Self {
        let stream = Self::default();
        {
            let mut inner = stream.lock();
            inner.name = name.into();
            inner.sink = Some(Sink::Memory(header(&inner.name)));
        }
        stream
    }

    /// Open (or re-open) the stream on a file.
    ///
    /// `$TIMESTAMP` in `template` is replaced by the local time. Missing
    /// parent folders are created.
    pub fn open(&self, name: &str, template: &str) -> io::Result<()> {
        let mut inner = self.lock();
        close_sink(&mut inner);

        let path = PathBuf::from(template.replace("$TIMESTAMP", &now(FILE_STAMP)));
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }
        let mut file = File::options()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(header(name).as_bytes())?;
        file.flush()?;

        inner.name = name.to_string();
        inner.template = Some(template.to_string());
        inner.path = Some(path);
        inner.sink = Some(Sink::File(file));
        Ok(())
    }

    /// Close the current file and start a new one from the same template.
    ///
    /// A memory stream is simply emptied.
    pub fn reopen(&self) -> io::Result<()> {
        let (name, template) = {
            let mut inner = self.lock();
            if matches!(inner.sink, Some(Sink::Memory(_))) {
                let head = header(&inner.name);
                inner.sink = Some(Sink::Memory(head));
                return Ok(());
            }
            (inner.name.clone(), inner.template.clone())
        };
        match template {
            Some(template) => self.open(&name, &template),
            None => Ok(()),
        }
    }

    pub fn write(&self, text: &str) {
        let mut inner = self.lock();
        let name = inner.name.clone();
        trace!(stream = %name, "{}", text.trim_end());

        match inner.sink.as_mut() {
            Some(Sink::Memory(buf)) => buf.push_str(text),
            Some(Sink::File(file)) => {
                if let Err(e) = file.write_all(text.as_bytes()).and_then(|_| file.flush()) {
                    warn!(stream = %name, error = %e, "cannot write to the log file");
                }
            }
            Some(Sink::Closed) | None => {}
        }
    }

    /// Write `text` prefixed by the local date and time.
    pub fn write_stamped(&self, text: &str) {
        self.write(&format!("({}) {text}", now(LINE_STAMP)));
    }

    /// Content of the stream, or `None` when it is not open.
    ///
    /// With a non-zero `max_size`, only the end of a larger content is
    /// returned, prefixed by `...`.
    pub fn dump(&self, max_size: usize) -> Option<String> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let bytes = match inner.sink.as_mut()? {
            Sink::Closed => return None,
            Sink::Memory(buf) => buf.as_bytes().to_vec(),
            Sink::File(file) => match read_back(file) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(stream = %inner.name, error = %e, "cannot read back the log file");
                    return None;
                }
            },
        };
        Some(tail(&bytes, max_size))
    }

    /// Close the stream and remove its file.
    pub fn delete(&self) {
        let mut inner = self.lock();
        close_sink(&mut inner);
        if let Some(path) = inner.path.take()
            && path.exists()
            && let Err(e) = fs::remove_file(&path)
        {
            warn!(path = %path.display(), error = %e, "cannot remove the log file");
        }
        inner.sink = None;
    }

    pub fn close(&self) {
        close_sink(&mut self.lock());
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.lock().sink,
            Some(Sink::Memory(_)) | Some(Sink::File(_))
        )
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    /// Path of the file currently written, if any.
    pub fn path(&self) -> Option<PathBuf> {
        self.lock().path.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for OutStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("OutStream")
            .field("name", &inner.name)
            .field("path", &inner.path)
            .finish()
    }
}

fn header(name: &str) -> String {
    let stars = "*".repeat(80);
    format!("{stars}\n*\n*                   {name}\n*\n{stars}\n\n")
}

fn close_sink(inner: &mut Inner) {
    match inner.sink.take() {
        Some(Sink::File(mut file)) => {
            let _ = file.write_all(FOOTER.as_bytes());
            inner.sink = Some(Sink::Closed);
        }
        Some(Sink::Memory(_)) | Some(Sink::Closed) => inner.sink = Some(Sink::Closed),
        None => {}
    }
}

fn read_back(file: &mut File) -> io::Result<Vec<u8>> {
    let pos = file.stream_position()?;
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::with_capacity(pos as usize);
    file.read_to_end(&mut bytes)?;
    file.seek(SeekFrom::Start(pos))?;
    Ok(bytes)
}

fn tail(bytes: &[u8], max_size: usize) -> String {
    if max_size == 0 {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let max_size = max_size.max(MIN_DUMP);
    if bytes.len() <= max_size {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let start = bytes.len() - (max_size - 4);
    format!("...\n{}", String::from_utf8_lossy(&bytes[start..]))
}

fn now(format: &[BorrowedFormatItem<'_>]) -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(format).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_stream_keeps_what_is_written() {
        let out = OutStream::memory("Job");
        out.write("> STATUS\n");
        out.write("< READY\n");

        let content = out.dump(0).unwrap();
        assert!(content.contains("*                   Job\n"));
        assert!(content.ends_with("> STATUS\n< READY\n"));
    }

    #[test]
    fn dump_keeps_the_end_of_large_content() {
        let out = OutStream::memory("Job");
        out.write(&"a".repeat(500));
        out.write("THE END");

        let content = out.dump(150).unwrap();
        assert!(content.starts_with("...\n"));
        assert!(content.ends_with("THE END"));
        assert_eq!(content.len(), 150);
    }

    #[test]
    fn small_limits_are_raised() {
        let out = OutStream::memory("Job");
        out.write(&"b".repeat(300));
        assert_eq!(out.dump(10).unwrap().len(), MIN_DUMP);
    }

    #[test]
    fn closed_stream_has_nothing_to_dump() {
        let out = OutStream::default();
        assert!(out.dump(0).is_none());

        let out = OutStream::memory("Job");
        out.close();
        assert!(out.dump(0).is_none());
        assert!(!out.is_open());
    }

    #[test]
    fn file_stream_replaces_timestamp_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("logs/scheduler-$TIMESTAMP.log");

        let out = OutStream::open_new("Scheduler", template.to_str().unwrap());
        out.write("started\n");

        let path = out.path().unwrap();
        assert!(!path.to_string_lossy().contains("$TIMESTAMP"));
        assert!(out.dump(0).unwrap().ends_with("started\n"));

        out.delete();
        assert!(!path.exists());
        assert!(out.dump(0).is_none());
    }

    #[test]
    fn closing_a_file_appends_the_footer() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("task.log");

        let out = OutStream::open_new("Task", template.to_str().unwrap());
        out.write("line\n");
        out.close();

        let content = fs::read_to_string(&template).unwrap();
        assert!(content.ends_with(FOOTER));
    }

    #[test]
    fn reopen_truncates_memory_stream() {
        let out = OutStream::memory("Task");
        out.write("old\n");
        out.reopen().unwrap();
        assert!(!out.dump(0).unwrap().contains("old"));
    }

    impl OutStream {
        fn open_new(name: &str, template: &str) -> Self {
            let out = OutStream::default();
            out.open(name, template).unwrap();
            out
        }
    }
}
