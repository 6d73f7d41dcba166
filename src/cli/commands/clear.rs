//! Clear command - delete the transform cache

use super::open_cache;
use crate::cli::args::ClearArgs;
use crate::config::Config;
use crate::error::TranscacheResult;
use crate::ui::{self, TaskSpinner, UiContext};

/// Execute the clear command
pub async fn execute(args: ClearArgs, config: &Config) -> TranscacheResult<()> {
    let ctx = UiContext::detect().with_auto_yes(args.yes);
    let cache = open_cache(&args.dir, config);
    let folder = cache.folder().display().to_string();

    if !cache.folder().exists() {
        ui::step_info(&ctx, &format!("Nothing to clear at {}", folder));
        return Ok(());
    }

    let prompt = format!("Delete the transform cache at {}?", folder);
    if !ui::confirm(&ctx, &prompt, false).await? {
        ui::step_warn_hint(&ctx, "Cache not cleared", "pass --yes to skip confirmation");
        return Ok(());
    }

    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start("Deleting transform cache...");
    match cache.store().erase(None) {
        Ok(()) => {
            spinner.stop(&format!("Cleared {}", folder));
            Ok(())
        }
        Err(e) => {
            spinner.stop_error("Failed to clear the transform cache");
            Err(e)
        }
    }
}
