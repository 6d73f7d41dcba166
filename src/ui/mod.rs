//! Terminal output for the CLI
//!
//! Uses `cliclack` framing and `indicatif` bars on an interactive terminal,
//! with plain prefixed lines in CI and when output is piped.
//!
//! # Example
//!
//! ```rust,ignore
//! use transcache::ui::{self, UiContext};
//!
//! let ctx = UiContext::detect().with_auto_yes(args.yes);
//!
//! ui::intro(&ctx, "transcache build");
//! ui::step_ok_detail(&ctx, "Reused transform cache", "/var/cache/transcache");
//!
//! if ui::confirm(&ctx, "Delete the transform cache?", false).await? {
//!     // ...
//! }
//! ```

mod context;
mod output;
mod progress;
mod prompts;

pub use context::UiContext;
pub use output::{
    human_bytes, intro, key_value, outro_success, outro_warn, remark, step_info, step_ok,
    step_ok_detail, step_warn_hint,
};
pub use progress::{BuildProgress, TaskSpinner};
pub use prompts::confirm;
