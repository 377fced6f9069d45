use std::io::{IsTerminal, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::Dispatch;

use crate::entity::Tags;

/// Diagnostics for one run: the tracing dispatcher every stage logs into and
/// whether progress is drawn on stderr.
///
/// Nothing is installed process-wide. Each stage (and each worker thread it
/// spawns) enters the dispatcher through [`Diagnostics::in_scope`].
#[derive(Clone)]
pub struct Diagnostics {
    dispatch: Dispatch,
    show_progress: bool,
}

impl Diagnostics {
    pub fn new(dispatch: Dispatch, show_progress: bool) -> Self {
        Self {
            dispatch,
            show_progress: show_progress && std::io::stderr().is_terminal(),
        }
    }

    /// No logging, no progress output.
    #[cfg(test)]
    pub fn quiet() -> Self {
        Self {
            dispatch: Dispatch::none(),
            show_progress: false,
        }
    }

    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }

    pub fn progress(&self, label: &'static str, total: u64) -> ProgressCounter {
        ProgressCounter::new(label, total, self.show_progress)
    }
}

/// Advisory progress: bytes consumed out of the stream size, drawn in whole
/// percent steps.
pub struct ProgressCounter {
    label: &'static str,
    total: u64,
    enabled: bool,
    position: AtomicU64,
}

impl ProgressCounter {
    pub fn new(label: &'static str, total: u64, enabled: bool) -> Self {
        let counter = Self {
            label,
            total,
            enabled,
            position: AtomicU64::new(0),
        };
        counter.print(0);
        counter
    }

    pub fn update(&self, position: u64) {
        let prev = self.position.fetch_max(position, Ordering::SeqCst);
        // Print if we crossed a percent boundary
        if prev < position && self.percent(prev) < self.percent(position) {
            self.print(position);
        }
    }

    pub fn finish(&self) {
        if self.enabled {
            self.print(self.total.max(self.position.load(Ordering::SeqCst)));
            eprintln!();
        }
    }

    fn percent(&self, position: u64) -> u64 {
        if self.total == 0 {
            return 0;
        }
        position.min(self.total) * 100 / self.total
    }

    fn print(&self, position: u64) {
        if !self.enabled {
            return;
        }
        eprint!("\r{}: {}%", self.label, self.percent(position));
        let _ = std::io::stderr().flush();
    }
}

/// Reader wrapper that publishes the number of bytes consumed so far.
pub struct CountingReader<R> {
    inner: R,
    offset: Arc<AtomicU64>,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            offset: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn offset_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.offset)
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.offset.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

pub fn build_tag_map<'a, I>(tags: I) -> Tags
where
    I: Iterator<Item = (&'a str, &'a str)>,
{
    tags.map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_reader_tracks_offset() {
        let data = b"0123456789";
        let mut reader = CountingReader::new(&data[..]);
        let offset = reader.offset_handle();

        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(offset.load(Ordering::Relaxed), 4);

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(offset.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn progress_percent_is_clamped() {
        let progress = ProgressCounter::new("test", 200, false);
        assert_eq!(progress.percent(0), 0);
        assert_eq!(progress.percent(100), 50);
        assert_eq!(progress.percent(500), 100);

        let empty = ProgressCounter::new("empty", 0, false);
        assert_eq!(empty.percent(10), 0);
    }

    #[test]
    fn build_tag_map_collects_pairs() {
        let tags = build_tag_map([("highway", "path"), ("name", "Ridge")].into_iter());
        assert_eq!(tags.get("highway").map(String::as_str), Some("path"));
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn quiet_diagnostics_run_closures() {
        let diagnostics = Diagnostics::quiet();
        assert_eq!(diagnostics.in_scope(|| 40 + 2), 42);
    }
}
