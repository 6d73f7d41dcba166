//! Output functions for consistent CLI formatting
//!
//! Interactive terminals get cliclack log lines; everything else gets
//! bracketed plain-text prefixes that are easy to grep in CI logs.

use super::context::UiContext;
use console::style;

#[derive(Debug, Clone, Copy)]
enum Level {
    Ok,
    Warn,
    Info,
}

impl Level {
    fn plain_prefix(self) -> String {
        match self {
            Self::Ok => style("[OK]").green().to_string(),
            Self::Warn => style("[WARN]").yellow().to_string(),
            Self::Info => style("[INFO]").cyan().to_string(),
        }
    }
}

fn step(ctx: &UiContext, level: Level, message: &str) {
    if ctx.use_fancy_output() {
        let _ = match level {
            Level::Ok => cliclack::log::success(message),
            Level::Warn => cliclack::log::warning(message),
            Level::Info => cliclack::log::info(message),
        };
    } else {
        println!("  {} {}", level.plain_prefix(), message);
    }
}

/// Display intro banner
pub fn intro(ctx: &UiContext, title: &str) {
    if ctx.use_fancy_output() {
        cliclack::intro(style(title).cyan().bold()).ok();
    } else {
        println!("{}", style(title).cyan().bold());
    }
}

/// Display success outro
pub fn outro_success(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        cliclack::outro(style(message).green().bold()).ok();
    } else {
        println!("{} {}", style("[OK]").green(), message);
    }
}

/// Display warning outro
pub fn outro_warn(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        cliclack::outro(style(message).yellow().bold()).ok();
    } else {
        println!("{} {}", style("[WARN]").yellow(), message);
    }
}

/// Display a success step
pub fn step_ok(ctx: &UiContext, message: &str) {
    step(ctx, Level::Ok, message);
}

/// Display a success step with detail
pub fn step_ok_detail(ctx: &UiContext, message: &str, detail: &str) {
    step(ctx, Level::Ok, &format!("{} ({})", message, style(detail).dim()));
}

/// Display a warning step with hint
pub fn step_warn_hint(ctx: &UiContext, message: &str, hint: &str) {
    step(ctx, Level::Warn, &format!("{} - {}", message, style(hint).dim()));
}

/// Display an info step
pub fn step_info(ctx: &UiContext, message: &str) {
    step(ctx, Level::Info, message);
}

/// Display a remark/hint
pub fn remark(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        cliclack::log::remark(message).ok();
    } else {
        println!("  {}", style(message).dim());
    }
}

/// Print styled key-value pair
pub fn key_value(ctx: &UiContext, key: &str, value: &str) {
    if ctx.use_fancy_output() {
        println!("  {}: {}", style(key).dim(), value);
    } else {
        println!("  {}: {}", key, value);
    }
}

/// Format bytes as human-readable size (e.g., "1.5 MB")
pub fn human_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
