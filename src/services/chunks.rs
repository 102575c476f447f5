use chrono::{DateTime, Duration, FixedOffset, SecondsFormat};
use core::fmt;

/// Half-open `[start, end)` interval requested from the range endpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

impl FetchWindow {
    pub fn new(start: DateTime<FixedOffset>, end: DateTime<FixedOffset>) -> Self {
        FetchWindow { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn length(&self) -> Duration {
        if self.is_empty() {
            Duration::zero()
        } else {
            self.end - self.start
        }
    }
}

impl fmt::Display for FetchWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.to_rfc3339_opts(SecondsFormat::Secs, false),
            self.end.to_rfc3339_opts(SecondsFormat::Secs, false)
        )
    }
}

/// Iterator over consecutive sub-windows of at most `step` length.
///
/// Pure function of its inputs: cloning or re-splitting yields the same sequence.
#[derive(Debug, Clone)]
pub struct Chunks {
    cursor: DateTime<FixedOffset>,
    end: DateTime<FixedOffset>,
    step: Duration,
}

impl Iterator for Chunks {
    type Item = FetchWindow;

    fn next(&mut self) -> Option<FetchWindow> {
        if self.cursor >= self.end {
            return None;
        }
        let chunk_end = self
            .cursor
            .checked_add_signed(self.step)
            .map_or(self.end, |t| t.min(self.end));
        let chunk = FetchWindow::new(self.cursor, chunk_end);
        self.cursor = chunk_end;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = chunk_count(self.end - self.cursor, self.step);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Chunks {}

/// Split `window` into `[t0, min(t0 + step, end))` pieces; an empty window yields nothing.
///
/// Non-positive steps are treated as one minute.
pub fn split(window: FetchWindow, step: Duration) -> Chunks {
    let step = if step <= Duration::zero() { Duration::minutes(1) } else { step };
    Chunks {
        cursor: window.start,
        end: window.end,
        step,
    }
}

fn chunk_count(span: Duration, step: Duration) -> usize {
    if span <= Duration::zero() {
        return 0;
    }
    let span_ms = span.num_milliseconds();
    let step_ms = step.num_milliseconds().max(1);
    ((span_ms + step_ms - 1) / step_ms) as usize
}
