//! Progress indicators with CI fallback

use super::context::UiContext;
use crate::cache::{BuildObserver, BuildPhase};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// A task spinner with CI fallback
pub struct TaskSpinner {
    spinner: Option<cliclack::ProgressBar>,
    interactive: bool,
}

impl TaskSpinner {
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            spinner: None,
            interactive: ctx.use_fancy_output(),
        }
    }

    /// Start the spinner with a message
    pub fn start(&mut self, message: &str) {
        if self.interactive {
            let spinner = cliclack::spinner();
            spinner.start(message);
            self.spinner = Some(spinner);
        } else {
            println!("{} {}", style("...").dim(), message);
        }
    }

    /// Stop with success message
    pub fn stop(&mut self, message: &str) {
        match self.spinner.take() {
            Some(spinner) => spinner.stop(message),
            None => println!("{} {}", style("[OK]").green(), message),
        }
    }

    /// Stop with error message
    pub fn stop_error(&mut self, message: &str) {
        match self.spinner.take() {
            Some(spinner) => spinner.error(message),
            None => println!("{} {}", style("[FAIL]").red(), message),
        }
    }
}

/// Progress of a cache build: one bar per phase on a terminal, one line
/// per phase otherwise.
pub struct BuildProgress {
    interactive: bool,
    bar: Option<ProgressBar>,
}

impl BuildProgress {
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            interactive: ctx.use_fancy_output(),
            bar: None,
        }
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("  {spinner:.cyan} {prefix:<8} {bar:24.cyan/dim} {pos}/{len} {msg:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
            .progress_chars("━╸─")
    }

    /// Finish the current bar, if any
    pub fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

impl BuildObserver for BuildProgress {
    fn phase(&mut self, phase: BuildPhase, total: usize) {
        self.finish();
        if !self.interactive {
            println!("  {} {} ({} items)", style("...").dim(), phase, total);
            return;
        }

        let bar = ProgressBar::new(total as u64);
        bar.set_style(Self::bar_style());
        bar.set_prefix(phase.to_string());
        bar.enable_steady_tick(Duration::from_millis(120));
        self.bar = Some(bar);
    }

    fn advance(&mut self, item: &str) {
        if let Some(ref bar) = self.bar {
            bar.set_message(shorten(item, 48));
            bar.inc(1);
        }
    }
}

impl Drop for BuildProgress {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Keep the tail of long names, which carries the class name
fn shorten(item: &str, max: usize) -> String {
    let count = item.chars().count();
    if count <= max {
        return item.to_string();
    }
    let tail: String = item.chars().skip(count - (max - 3)).collect();
    format!("...{}", tail)
}
