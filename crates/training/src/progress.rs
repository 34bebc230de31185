use std::{fmt::Write as _, time::Duration};

use indicatif::{ProgressBar, ProgressStyle};

use crate::{data::InputSize, metrics::AverageMeter};

/// Receives formatted status lines from the epoch loop.
pub trait ProgressSink: Send {
    /// Called once before the first batch of an epoch.
    fn begin(&mut self, _total: usize) {}

    fn status(&mut self, line: &str);

    /// Called after every batch when the sink renders continuously.
    fn advance(&mut self) {}

    fn finish(&mut self) {}
}

/// Prints `task/exp_id| <status>` lines to stdout.
#[derive(Debug, Clone)]
pub struct PrintSink {
    prefix: String,
}

impl PrintSink {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl ProgressSink for PrintSink {
    fn status(&mut self, line: &str) {
        println!("{}| {}", self.prefix, line);
    }
}

/// Live terminal bar whose message is the latest status line.
pub struct BarSink {
    prefix: String,
    bar: Option<ProgressBar>,
}

impl BarSink {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            bar: None,
        }
    }
}

impl ProgressSink for BarSink {
    fn begin(&mut self, total: usize) {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::with_template("{prefix} {bar:30.cyan/blue} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        bar.set_prefix(self.prefix.clone());
        self.bar = Some(bar);
    }

    fn status(&mut self, line: &str) {
        if let Some(bar) = self.bar.as_ref() {
            bar.set_message(line.to_string());
        }
    }

    fn advance(&mut self) {
        if let Some(bar) = self.bar.as_ref() {
            bar.inc(1);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish();
        }
    }
}

/// Default sink for a print interval: periodic lines when positive, a live bar otherwise.
pub fn default_sink(prefix: impl Into<String>, print_iter: i64) -> Box<dyn ProgressSink> {
    if print_iter > 0 {
        Box::new(PrintSink::new(prefix))
    } else {
        Box::new(BarSink::new(prefix))
    }
}

/// Applies the print interval to a sink.
pub struct ProgressReporter<'a> {
    sink: &'a mut dyn ProgressSink,
    print_iter: i64,
}

impl<'a> ProgressReporter<'a> {
    pub fn begin(sink: &'a mut dyn ProgressSink, print_iter: i64, total: usize) -> Self {
        sink.begin(total);
        Self { sink, print_iter }
    }

    pub fn report(&mut self, batch_index: usize, line: &str) {
        if self.print_iter > 0 {
            if batch_index as i64 % self.print_iter == 0 {
                self.sink.status(line);
            }
        } else {
            self.sink.status(line);
            self.sink.advance();
        }
    }

    pub fn finish(self) {
        self.sink.finish();
    }
}

/// Builder for the per-batch status line.
#[derive(Debug, Default)]
pub struct StatusLine {
    line: String,
}

impl StatusLine {
    pub fn new(
        phase: &str,
        epoch: usize,
        batch_index: usize,
        total: usize,
        elapsed: Duration,
    ) -> Self {
        let eta = estimate_remaining(elapsed, batch_index, total);
        let line = format!(
            "{}: [{}][{}/{}]|Tot: {} |ETA: {} ",
            phase,
            epoch,
            batch_index,
            total,
            format_duration(elapsed),
            format_duration(eta)
        );
        Self { line }
    }

    pub fn metric(mut self, name: &str, average: f64) -> Self {
        let _ = write!(self.line, "|{} {:.4} ", name, average);
        self
    }

    pub fn input_size(mut self, size: InputSize) -> Self {
        let _ = write!(self.line, "|Img_size(wh) {}×{}", size.width, size.height);
        self
    }

    pub fn timing(mut self, data_time: &AverageMeter, batch_time: &AverageMeter) -> Self {
        let _ = write!(
            self.line,
            "|Data {:.3}s({:.3}s) |Net {:.3}s",
            data_time.val, data_time.avg, batch_time.avg
        );
        self
    }

    pub fn as_str(&self) -> &str {
        &self.line
    }

    pub fn into_string(self) -> String {
        self.line
    }
}

/// Renders a duration as `H:MM:SS`.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

fn estimate_remaining(elapsed: Duration, batch_index: usize, total: usize) -> Duration {
    let done = batch_index + 1;
    if done >= total {
        return Duration::ZERO;
    }
    elapsed.mul_f64((total - done) as f64 / done as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct Recorder {
        lines: Arc<Mutex<Vec<String>>>,
        advances: Arc<Mutex<usize>>,
    }

    impl ProgressSink for Recorder {
        fn status(&mut self, line: &str) {
            self.lines.lock().unwrap().push(line.to_string());
        }

        fn advance(&mut self) {
            *self.advances.lock().unwrap() += 1;
        }
    }

    #[test]
    fn durations_render_like_timedeltas() {
        assert_eq!(format_duration(Duration::from_secs(5)), "0:00:05");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1:02:05");
    }

    #[test]
    fn status_line_layout() {
        let mut data = AverageMeter::new();
        data.update(0.25);
        let mut net = AverageMeter::new();
        net.update(0.5);

        let line = StatusLine::new("train", 3, 1, 4, Duration::from_secs(10))
            .metric("loss", 1.23451)
            .input_size(InputSize::new(864, 480))
            .timing(&data, &net)
            .into_string();

        assert_eq!(
            line,
            "train: [3][1/4]|Tot: 0:00:10 |ETA: 0:00:10 |loss 1.2345 \
             |Img_size(wh) 864×480|Data 0.250s(0.250s) |Net 0.500s"
        );
    }

    #[test]
    fn periodic_mode_prints_every_interval() {
        let mut recorder = Recorder::default();
        let lines = recorder.lines.clone();
        let mut reporter = ProgressReporter::begin(&mut recorder, 2, 5);
        for index in 0..5 {
            reporter.report(index, &format!("batch {index}"));
        }
        reporter.finish();

        assert_eq!(*lines.lock().unwrap(), vec!["batch 0", "batch 2", "batch 4"]);
        assert_eq!(*recorder.advances.lock().unwrap(), 0);
    }

    #[test]
    fn continuous_mode_updates_every_batch() {
        let mut recorder = Recorder::default();
        let mut reporter = ProgressReporter::begin(&mut recorder, 0, 3);
        for index in 0..3 {
            reporter.report(index, "status");
        }
        reporter.finish();

        assert_eq!(recorder.lines.lock().unwrap().len(), 3);
        assert_eq!(*recorder.advances.lock().unwrap(), 3);
    }
}
