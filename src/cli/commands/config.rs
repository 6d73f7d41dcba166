//! Config command - show or edit configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{Config, ConfigManager};
use crate::error::{TranscacheError, TranscacheResult};
use crate::ui::{self, UiContext};
use toml_edit::{value, Array, DocumentMut, Item, Table};

/// Execute the config command
pub async fn execute(
    args: ConfigArgs,
    config: &Config,
    manager: &ConfigManager,
) -> TranscacheResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(config)?,
        Some(ConfigAction::Path) => println!("{}", manager.path().display()),
        Some(ConfigAction::Init { force }) => init_config(manager, force).await?,
        Some(ConfigAction::Set { key, value }) => set_value(manager, &key, &value).await?,
    }

    Ok(())
}

fn show_config(config: &Config) -> TranscacheResult<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

async fn init_config(manager: &ConfigManager, force: bool) -> TranscacheResult<()> {
    let ctx = UiContext::detect();
    let path = manager.path();

    if path.exists() && !force {
        ui::step_warn_hint(
            &ctx,
            &format!("Config already exists at {}", path.display()),
            "Use --force to overwrite",
        );
        return Ok(());
    }

    manager.save(&Config::default()).await?;
    ui::step_ok_detail(&ctx, "Configuration initialized", &path.display().to_string());
    Ok(())
}

/// Edit one key in place, keeping the rest of the file and its comments
async fn set_value(manager: &ConfigManager, key: &str, raw: &str) -> TranscacheResult<()> {
    let ctx = UiContext::detect();
    let text = manager.read_raw().await?;
    let updated = apply_setting(&text, key, raw).map_err(|reason| TranscacheError::ConfigInvalid {
        path: manager.path().to_path_buf(),
        reason,
    })?;

    manager.write(&updated).await?;
    ui::step_ok(&ctx, &format!("Set {} = {}", key, raw));
    Ok(())
}

/// Set `key` to `raw` in the TOML `text` and validate the result
fn apply_setting(text: &str, key: &str, raw: &str) -> Result<String, String> {
    let mut doc: DocumentMut = text.parse().map_err(|e: toml_edit::TomlError| e.to_string())?;

    let parts: Vec<&str> = key.split('.').collect();
    let item = match parts.as_slice() {
        ["general", "log_format"] => match raw {
            "text" | "json" => value(raw),
            _ => return Err(format!("log_format must be text or json, got '{}'", raw)),
        },
        ["cache", "dir" | "bootstrap_unit"] => value(raw),
        ["cache", "log_changed_keys" | "preload" | "development"]
        | ["transform", "decorate_configs"]
        | ["transform", "flags", _] => value(parse_bool(raw)?),
        ["transform", "rewriter"] => {
            let argv: Array = raw.split_whitespace().collect();
            value(argv)
        }
        _ => {
            return Err(format!(
                "unknown config key '{}', valid keys: {}",
                key,
                VALID_KEYS.join(", ")
            ))
        }
    };

    let (leaf, tables) = parts
        .split_last()
        .ok_or_else(|| "empty config key".to_string())?;
    let mut table: &mut Table = doc.as_table_mut();
    for name in tables {
        let entry = table
            .entry(name)
            .or_insert_with(|| Item::Table(Table::new()));
        table = entry
            .as_table_mut()
            .ok_or_else(|| format!("'{}' is not a table", name))?;
    }
    table.insert(leaf, item);

    let updated = doc.to_string();
    toml::from_str::<Config>(&updated).map_err(|e| e.to_string())?;
    Ok(updated)
}

const VALID_KEYS: &[&str] = &[
    "general.log_format",
    "cache.dir",
    "cache.log_changed_keys",
    "cache.preload",
    "cache.development",
    "cache.bootstrap_unit",
    "transform.decorate_configs",
    "transform.rewriter",
    "transform.flags.<name>",
];

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(format!("invalid boolean value '{}', use true/false", raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_keeps_comments() {
        let text = "# my settings\n[cache]\npreload = true # warm\n";
        let updated = apply_setting(text, "cache.preload", "false").unwrap();
        assert!(updated.contains("# my settings"));
        let config: Config = toml::from_str(&updated).unwrap();
        assert!(!config.cache.preload);
    }

    #[test]
    fn set_creates_nested_flag_table() {
        let updated = apply_setting("", "transform.flags.x", "yes").unwrap();
        let config: Config = toml::from_str(&updated).unwrap();
        assert_eq!(config.transform.flags.get("x"), Some(&true));
    }

    #[test]
    fn set_rewriter_splits_argv() {
        let updated = apply_setting("", "transform.rewriter", "java -jar rw.jar").unwrap();
        let config: Config = toml::from_str(&updated).unwrap();
        assert_eq!(config.transform.rewriter, vec!["java", "-jar", "rw.jar"]);
    }

    #[test]
    fn set_rejects_unknown_and_invalid() {
        assert!(apply_setting("", "vm.name", "x").is_err());
        assert!(apply_setting("", "cache.preload", "maybe").is_err());
        assert!(apply_setting("", "general.log_format", "xml").is_err());
    }
}
