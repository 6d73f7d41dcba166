//! Keys command - print the options record the inputs would produce

use super::load_inputs;
use crate::cache::CacheKeyBuilder;
use crate::cli::args::KeysArgs;
use crate::config::Config;
use crate::error::TranscacheResult;

/// Execute the keys command
pub async fn execute(args: KeysArgs, config: &Config) -> TranscacheResult<()> {
    let loaded = load_inputs(&args.input, config).await?;
    let keys = CacheKeyBuilder::build(
        &loaded.inputs.units,
        &loaded.inputs.solved,
        &loaded.flags,
    )?;
    print!("{}", keys.to_options());
    Ok(())
}
