//! Live progress view of a running evaluation.
//!
//! The reporter keeps nothing but a handle to the [`TaskBoard`]. On every tick
//! it takes a snapshot and redraws. Rendering is a pure function of the
//! snapshot and the terminal height, so it is tested without a terminal.

use std::fmt::Write as _;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use crossterm::{cursor, queue, terminal};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::TaskState;
use crate::runner::{TaskBoard, TaskSnapshot};
use crate::stats::{percent, EvalMetrics};

/// Rows reserved for output above and below the live table.
pub const DISPLAY_OVERHEAD: usize = 5;

pub const REFRESH_INTERVAL: Duration = Duration::from_millis(250);

/// Height assumed when the terminal size is unknown.
const FALLBACK_ROWS: usize = 24;

pub const PASS: &str = "✓";
pub const FAIL: &str = "✗";
pub const CACHED: &str = "●";
pub const RUNNING: &str = "◐";
pub const PENDING: &str = "○";

pub(crate) const GREEN: &str = "\x1b[32m";
pub(crate) const YELLOW: &str = "\x1b[33m";
pub(crate) const RED: &str = "\x1b[31m";
pub(crate) const BLUE: &str = "\x1b[34m";
pub(crate) const DIM: &str = "\x1b[2m";
pub(crate) const BOLD: &str = "\x1b[1m";
pub(crate) const RESET: &str = "\x1b[0m";

/// ANSI color for a percentage: green from 80, yellow from 50, else red.
pub fn rate_color(pct: f64) -> &'static str {
    if pct >= 80.0 {
        GREEN
    } else if pct >= 50.0 {
        YELLOW
    } else {
        RED
    }
}

fn paint(text: &str, color: &str, enabled: bool) -> String {
    if enabled {
        format!("{color}{text}{RESET}")
    } else {
        text.to_string()
    }
}

pub fn symbol(state: &TaskState) -> &'static str {
    match state {
        TaskState::Pending => PENDING,
        TaskState::Running => RUNNING,
        TaskState::Cached(_) => CACHED,
        TaskState::Done(g) if g.passed => PASS,
        TaskState::Done(_) => FAIL,
    }
}

/// Sample counts by display category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub passed: usize,
    pub failed: usize,
    pub cached: usize,
    pub running: usize,
    pub pending: usize,
}

impl StatusCounts {
    pub fn from_snapshot(snapshot: &TaskSnapshot) -> Self {
        let mut counts = Self::default();
        for state in &snapshot.states {
            match state {
                TaskState::Pending => counts.pending += 1,
                TaskState::Running => counts.running += 1,
                TaskState::Cached(_) => counts.cached += 1,
                TaskState::Done(g) if g.passed => counts.passed += 1,
                TaskState::Done(_) => counts.failed += 1,
            }
        }
        counts
    }
}

/// Whether `eval_count` rows fit in a terminal `terminal_rows` tall.
pub fn should_compact(eval_count: usize, terminal_rows: usize) -> bool {
    eval_count > terminal_rows.saturating_sub(DISPLAY_OVERHEAD)
}

fn compact_line(snapshot: &TaskSnapshot, color: bool) -> String {
    let c = StatusCounts::from_snapshot(snapshot);
    [
        paint(&format!("{} evals", snapshot.eval_count()), BOLD, color),
        paint(&format!("{PASS} {}", c.passed), GREEN, color),
        paint(&format!("{FAIL} {}", c.failed), RED, color),
        paint(&format!("{CACHED} {}", c.cached), BLUE, color),
        paint(&format!("{RUNNING} {}", c.running), YELLOW, color),
        paint(&format!("{PENDING} {}", c.pending), DIM, color),
    ]
    .join("  ")
}

fn eval_row(label: &str, width: usize, states: &[&TaskState], color: bool) -> String {
    let mut row = format!("{label:<width$}  ");
    let symbols: Vec<&str> = states.iter().map(|s| symbol(s)).collect();
    row.push_str(&symbols.join(" "));

    if !states.is_empty() && states.iter().all(|s| s.is_terminal()) {
        let passed = states.iter().filter(|s| s.passed()).count();
        let pct = percent(passed, states.len());
        let _ = write!(row, " {}", paint(&format!("({pct:.0}%)"), rate_color(pct), color));
    }
    row
}

/// Render the live table for `snapshot` in a terminal `terminal_rows` tall.
///
/// Returns one line per eval, or a single aggregate line when the evals do
/// not fit.
pub fn render(snapshot: &TaskSnapshot, terminal_rows: usize, color: bool) -> Vec<String> {
    if should_compact(snapshot.eval_count(), terminal_rows) {
        return vec![compact_line(snapshot, color)];
    }

    let width = snapshot
        .eval_labels
        .iter()
        .map(|l| l.chars().count())
        .max()
        .unwrap_or(0);
    snapshot
        .by_eval()
        .iter()
        .zip(snapshot.eval_labels.iter())
        .map(|(states, label)| eval_row(label, width, states, color))
        .collect()
}

/// Summary printed once a run has settled. The breakdown uses the same
/// categories as the live compact line: cached samples are counted once,
/// under cached, whatever their verdict.
pub fn final_summary(
    metrics: &EvalMetrics,
    snapshot: &TaskSnapshot,
    timed_out: bool,
    color: bool,
) -> String {
    let mut out = String::new();
    let pct = metrics.pass_rate;
    let c = StatusCounts::from_snapshot(snapshot);
    let _ = writeln!(
        out,
        "Pass rate: {} ({}/{})",
        paint(&format!("{pct:.1}%"), rate_color(pct), color),
        metrics.total_pass,
        metrics.total_runs,
    );
    let _ = write!(
        out,
        "  passed {}  failed {}  cached {}  running {}  pending {}",
        c.passed, c.failed, c.cached, c.running, c.pending,
    );
    if timed_out {
        let _ = write!(out, "\n{}", paint("Run timed out before every sample finished", RED, color));
    }
    out
}

/// Options for [`ProgressReporter::spawn`].
#[derive(Debug, Clone, Copy)]
pub struct ProgressOptions {
    pub interval: Duration,
    pub color: bool,
}

impl Default for ProgressOptions {
    fn default() -> Self {
        Self {
            interval: REFRESH_INTERVAL,
            color: true,
        }
    }
}

fn terminal_rows() -> usize {
    terminal::size()
        .map(|(_, rows)| rows as usize)
        .unwrap_or(FALLBACK_ROWS)
}

fn redraw(out: &mut impl Write, previous: usize, lines: &[String]) -> io::Result<()> {
    if previous > 0 {
        queue!(
            out,
            cursor::MoveToPreviousLine(previous as u16),
            terminal::Clear(terminal::ClearType::FromCursorDown)
        )?;
    }
    for line in lines {
        writeln!(out, "{line}")?;
    }
    out.flush()
}

/// Background task redrawing a board on stderr at a fixed interval.
pub struct ProgressReporter {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ProgressReporter {
    pub fn spawn(board: Arc<TaskBoard>, options: ProgressOptions) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(options.interval);
            let mut drawn = 0usize;
            loop {
                let done = tokio::select! {
                    _ = ticker.tick() => false,
                    _ = stopped.changed() => true,
                };
                let lines = render(&board.snapshot(), terminal_rows(), options.color);
                let mut err = io::stderr().lock();
                if redraw(&mut err, drawn, &lines).is_err() {
                    break;
                }
                drawn = lines.len();
                if done {
                    break;
                }
            }
        });
        Self { stop, handle }
    }

    /// Draw the final state and stop redrawing.
    pub async fn finish(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EvalCase, GradeResult, Target};

    fn board(evals: usize, samples: usize) -> TaskBoard {
        let cases: Vec<EvalCase> = (0..evals)
            .map(|i| EvalCase::new(format!("e{i}.yaml"), "q", "a"))
            .collect();
        TaskBoard::new(cases.into(), samples, Target::Baseline)
    }

    fn grade(passed: bool) -> GradeResult {
        GradeResult {
            passed,
            ..GradeResult::failed("")
        }
    }

    fn finish(b: &TaskBoard, index: usize, state: TaskState) {
        b.advance(index, TaskState::Running).unwrap();
        b.advance(index, state).unwrap();
    }

    #[test]
    fn compact_boundary() {
        let rows = 10;
        let available = rows - DISPLAY_OVERHEAD;

        let fits = board(available, 1);
        assert_eq!(render(&fits.snapshot(), rows, false).len(), available);

        let overflow = board(available + 1, 1);
        let lines = render(&overflow.snapshot(), rows, false);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("6 evals"));
    }

    #[test]
    fn tiny_terminal_is_always_compact() {
        assert!(should_compact(1, 3));
        assert!(!should_compact(0, 3));
    }

    #[test]
    fn compact_line_lists_every_category() {
        let b = board(3, 2);
        finish(&b, 0, TaskState::Done(grade(true)));
        finish(&b, 1, TaskState::Done(grade(false)));
        finish(&b, 2, TaskState::Cached(grade(true)));
        b.advance(3, TaskState::Running).unwrap();

        let line = render(&b.snapshot(), 0, false).remove(0);
        assert_eq!(line, "3 evals  ✓ 1  ✗ 1  ● 1  ◐ 1  ○ 2");
    }

    #[test]
    fn percentage_only_when_eval_complete() {
        let b = board(1, 2);
        finish(&b, 0, TaskState::Done(grade(true)));
        let line = render(&b.snapshot(), 40, false).remove(0);
        assert_eq!(line, "e0.yaml  ✓ ○");

        finish(&b, 1, TaskState::Cached(grade(false)));
        let line = render(&b.snapshot(), 40, false).remove(0);
        assert_eq!(line, "e0.yaml  ✓ ● (50%)");
    }

    #[test]
    fn rate_colors() {
        assert_eq!(rate_color(80.0), GREEN);
        assert_eq!(rate_color(79.9), YELLOW);
        assert_eq!(rate_color(50.0), YELLOW);
        assert_eq!(rate_color(49.0), RED);
    }

    #[test]
    fn colored_percentage() {
        let b = board(1, 1);
        finish(&b, 0, TaskState::Done(grade(true)));
        let line = render(&b.snapshot(), 40, true).remove(0);
        assert!(line.ends_with(&format!("{GREEN}(100%){RESET}")));
    }

    #[test]
    fn summary_mentions_timeout() {
        let b = board(1, 2);
        finish(&b, 0, TaskState::Done(grade(true)));
        let metrics = EvalMetrics::from_snapshot(&b.snapshot());
        let text = final_summary(&metrics, &b.snapshot(), true, false);
        assert!(text.starts_with("Pass rate: 50.0% (1/2)"));
        assert!(text.contains("pending 1"));
        assert!(text.contains("timed out"));
    }

    #[test]
    fn summary_breakdown_matches_compact_line() {
        let b = board(2, 2);
        finish(&b, 0, TaskState::Done(grade(true)));
        finish(&b, 1, TaskState::Done(grade(false)));
        finish(&b, 2, TaskState::Cached(grade(true)));
        finish(&b, 3, TaskState::Cached(grade(false)));
        let snapshot = b.snapshot();
        let metrics = EvalMetrics::from_snapshot(&snapshot);

        let text = final_summary(&metrics, &snapshot, false, false);
        assert!(text.starts_with("Pass rate: 50.0% (2/4)"));
        assert!(text.ends_with("passed 1  failed 1  cached 2  running 0  pending 0"));

        let line = render(&snapshot, 0, false).remove(0);
        assert_eq!(line, "2 evals  ✓ 1  ✗ 1  ● 2  ◐ 0  ○ 0");
    }

    #[test]
    fn redraw_writes_lines() {
        let mut buf = Vec::new();
        redraw(&mut buf, 0, &["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "a\nb\n");
    }
}
