//! Build command - reuse or rebuild the transform cache

use super::{cache_dir, load_inputs};
use crate::cache::{BundleInputs, InvalidReason, TransformCache, TransformCacheResult};
use crate::cli::args::BuildArgs;
use crate::config::Config;
use crate::error::{TranscacheError, TranscacheResult};
use crate::rewriter;
use crate::ui::{self, BuildProgress, UiContext};
use tracing::debug;

/// Execute the build command
pub async fn execute(args: BuildArgs, config: &Config) -> TranscacheResult<()> {
    let ctx = UiContext::detect();
    ui::intro(&ctx, "transcache build");

    let loaded = load_inputs(&args.input, config).await?;
    let mut options = config.cache_options();
    options.log_changed_keys |= args.log_changed_keys;

    let cache = TransformCache::new(cache_dir(&args.dir, config), options);
    if args.force {
        debug!("--force: erasing {}", cache.folder().display());
        cache.store().erase(None)?;
    }

    let argv = config.transform.rewriter.clone();
    let progress_ctx = ctx.clone();

    // Copying and rewriting is blocking file IO from start to end.
    let result = tokio::task::spawn_blocking(move || {
        let mut rewriter = rewriter::from_config(&argv);
        let mut progress = BuildProgress::new(&progress_ctx);
        let inputs = BundleInputs {
            units: &loaded.inputs.units,
            solved: &loaded.inputs.solved,
            flags: &loaded.flags,
            unassociated: &loaded.inputs.unassociated,
        };
        cache.populate_transform_bundle(&inputs, rewriter.as_mut(), &mut progress)
    })
    .await
    .map_err(|e| TranscacheError::Internal(format!("build task failed: {}", e)))??;

    report(&ctx, &result);
    Ok(())
}

fn report(ctx: &UiContext, result: &TransformCacheResult) {
    let folder = result.folder.display().to_string();

    if !result.newly_generated {
        ui::step_ok_detail(ctx, "Reused transform cache", &folder);
        ui::key_value(ctx, "entries", &result.archive.entry_count().to_string());
        ui::outro_success(ctx, "Cache is up to date");
        return;
    }

    match &result.invalidated {
        Some(InvalidReason::Mismatch(diff)) => ui::step_info(
            ctx,
            &format!("Inputs changed ({} keys: {})", diff.len(), diff.keys().join(", ")),
        ),
        Some(reason) => ui::step_info(ctx, &format!("Previous cache {}", reason)),
        None => {}
    }

    let stats = &result.stats;
    ui::step_ok_detail(
        ctx,
        &format!(
            "Copied {} files from {} units",
            stats.copied_files, stats.units
        ),
        &ui::human_bytes(stats.copied_bytes),
    );
    ui::step_ok(
        ctx,
        &format!(
            "Rewrote {} of {} artifacts ({} widened)",
            stats.pipeline.written, stats.pipeline.artifacts, stats.pipeline.widened
        ),
    );
    ui::key_value(ctx, "archive", &result.archive.path().display().to_string());

    let message = format!("Transform cache written to {}", folder);
    if stats.pipeline.not_transformable > 0 {
        ui::step_warn_hint(
            ctx,
            &format!(
                "{} artifacts were refused by the rewriter",
                stats.pipeline.not_transformable
            ),
            "they are stored unchanged",
        );
        ui::remark(ctx, "run with -vv to list them");
        ui::outro_warn(ctx, &message);
    } else {
        ui::outro_success(ctx, &message);
    }
}
