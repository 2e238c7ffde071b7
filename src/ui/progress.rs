use std::io::IsTerminal;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// Upload progress. On a terminal this is a bar on stderr and status lines
/// are printed above it; otherwise the bar is hidden and lines go to stdout.
#[derive(Clone)]
pub struct Progress {
    bar: ProgressBar,
    visible: bool,
}

impl Progress {
    pub fn new(total: u64, message: &str) -> Self {
        if !std::io::stderr().is_terminal() {
            return Self::hidden();
        }
        let bar = ProgressBar::new(total);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix} [{bar:40.cyan/blue}] {pos}/{len} activities ({percent:>3}%) {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
        bar.set_style(style);
        bar.set_prefix(message.to_string());
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar, visible: true }
    }

    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
            visible: false,
        }
    }

    pub fn inc(&self) {
        self.bar.inc(1);
    }

    pub fn println(&self, line: &str) {
        if self.visible {
            self.bar.println(line);
        } else {
            println!("{line}");
        }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
