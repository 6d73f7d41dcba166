//! Check command - report whether the cache matches the inputs

use super::{load_inputs, open_cache};
use crate::cache::{BundleInputs, InvalidReason, Validity};
use crate::cli::args::CheckArgs;
use crate::config::Config;
use crate::error::{TranscacheError, TranscacheResult};

/// Execute the check command
///
/// Prints `valid` or the reason, and exits non-zero when the cache would be
/// rebuilt.
pub async fn execute(args: CheckArgs, config: &Config) -> TranscacheResult<()> {
    let loaded = load_inputs(&args.input, config).await?;
    let cache = open_cache(&args.dir, config);

    let inputs = BundleInputs {
        units: &loaded.inputs.units,
        solved: &loaded.inputs.solved,
        flags: &loaded.flags,
        unassociated: &loaded.inputs.unassociated,
    };
    let validity = cache.check(&inputs)?;
    println!("{}", validity);

    if let Validity::Invalid(InvalidReason::Mismatch(diff)) = &validity {
        for (key, old) in &diff.removed {
            println!("  - {}={}", key, old);
        }
        for (key, new) in &diff.added {
            println!("  + {}={}", key, new);
        }
        for (key, (old, new)) in &diff.changed {
            println!("  ~ {}: {} -> {}", key, old, new);
        }
    }

    match validity {
        Validity::Valid => Ok(()),
        Validity::Invalid(_) => Err(TranscacheError::User(
            "transform cache would be rebuilt".to_string(),
        )),
    }
}
