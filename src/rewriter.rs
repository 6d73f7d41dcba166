//! Pluggable artifact rewriter
//!
//! The cache does not know how artifacts are rewritten. It hands each code
//! artifact to a [`Rewriter`] together with a [`RewriteContext`], and only
//! distinguishes "refused this one artifact" from "failed".

use crate::cache::populate::ResourceRoots;
use crate::error::{TranscacheError, TranscacheResult};
use crate::unit::LoadUnit;
use std::collections::BTreeMap;
use std::io::Write;
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, info};

/// Exit status a rewriter command uses to refuse an artifact
pub const NOT_TRANSFORMABLE_EXIT: i32 = 3;

/// Failure of a single rewrite
#[derive(Error, Debug)]
pub enum RewriteError {
    /// The rewriter cannot handle this artifact; it is kept unchanged
    #[error("{name} is not transformable: {reason}")]
    NotTransformable { name: String, reason: String },

    /// Any other failure; fatal to the build
    #[error("rewriting {name} failed: {reason}")]
    Failed { name: String, reason: String },
}

/// Per-artifact view handed to the rewriter
#[derive(Debug, Clone, Copy)]
pub struct RewriteContext<'a> {
    /// Staged resource roots of every copied unit
    pub resources: &'a ResourceRoots,
    /// Unit owning the artifact; `None` if unassociated
    pub owner: Option<&'a str>,
}

/// Whether rewriter configs carry unit decorations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigDecoration {
    #[default]
    Decorated,
    Undecorated,
}

/// One rewriter configuration declared by a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriterConfig {
    /// Unit-scoped name, `#<unit id>:<config>`
    pub name: String,
    /// Declaring unit
    pub unit: String,
    pub decorations: BTreeMap<String, String>,
}

/// Everything a rewriter needs before the first artifact
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriterSetup {
    pub configs: Vec<RewriterConfig>,
}

impl RewriterSetup {
    /// Register every config the units declare
    ///
    /// Names are scoped by unit id; a name registered twice is an error.
    pub fn from_units(units: &[LoadUnit], decoration: ConfigDecoration) -> TranscacheResult<Self> {
        let mut seen: BTreeMap<String, String> = BTreeMap::new();
        let mut configs = Vec::new();

        for unit in units {
            for config in &unit.rewriter_configs {
                let name = format!("#{}:{}", unit.id, config);
                if let Some(first) = seen.insert(name.clone(), unit.id.clone()) {
                    return Err(TranscacheError::DuplicateRewriterConfig {
                        name,
                        first,
                        second: unit.id.clone(),
                    });
                }

                let mut decorations = BTreeMap::new();
                if decoration == ConfigDecoration::Decorated {
                    decorations.insert("unit-id".to_string(), unit.id.clone());
                    decorations.insert("compatibility".to_string(), "latest".to_string());
                }
                configs.push(RewriterConfig {
                    name,
                    unit: unit.id.clone(),
                    decorations,
                });
            }
        }

        debug!("Registered {} rewriter configs", configs.len());
        Ok(Self { configs })
    }
}

/// Rewrites one code artifact at a time
pub trait Rewriter: Send {
    /// Called once per build before the rewrite pass
    fn prepare(&mut self, _setup: &RewriterSetup) -> TranscacheResult<()> {
        Ok(())
    }

    /// Rewrite `bytes` of the artifact `old_name`, to be loaded as `new_name`
    fn transform(
        &mut self,
        ctx: &RewriteContext<'_>,
        old_name: &str,
        new_name: &str,
        bytes: &[u8],
    ) -> Result<Vec<u8>, RewriteError>;
}

/// Leaves every artifact unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityRewriter;

impl Rewriter for IdentityRewriter {
    fn transform(
        &mut self,
        _ctx: &RewriteContext<'_>,
        _old_name: &str,
        _new_name: &str,
        bytes: &[u8],
    ) -> Result<Vec<u8>, RewriteError> {
        Ok(bytes.to_vec())
    }
}

/// Runs an external program once per artifact
///
/// The artifact goes to stdin and the rewritten bytes come back on stdout.
/// Names, owner, resource roots and registered configs are passed in
/// `TRANSCACHE_*` environment variables. Exit status 3 refuses the artifact.
#[derive(Debug, Clone)]
pub struct CommandRewriter {
    program: String,
    args: Vec<String>,
    configs: String,
}

impl CommandRewriter {
    /// Build from an argv; `None` if it is empty
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            configs: String::new(),
        })
    }

    fn failed(name: &str, reason: impl Into<String>) -> RewriteError {
        RewriteError::Failed {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

impl Rewriter for CommandRewriter {
    fn prepare(&mut self, setup: &RewriterSetup) -> TranscacheResult<()> {
        self.configs = setup
            .configs
            .iter()
            .map(|c| {
                let decorations: Vec<String> =
                    c.decorations.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                if decorations.is_empty() {
                    c.name.clone()
                } else {
                    format!("{} {}", c.name, decorations.join(","))
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        info!("Using rewriter command: {} {}", self.program, self.args.join(" "));
        Ok(())
    }

    fn transform(
        &mut self,
        ctx: &RewriteContext<'_>,
        old_name: &str,
        new_name: &str,
        bytes: &[u8],
    ) -> Result<Vec<u8>, RewriteError> {
        let roots = ctx
            .resources
            .iter()
            .map(|(id, root)| format!("{}={}", id, root.display()))
            .collect::<Vec<_>>()
            .join("\n");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("TRANSCACHE_OLD_NAME", old_name)
            .env("TRANSCACHE_NEW_NAME", new_name)
            .env("TRANSCACHE_OWNER", ctx.owner.unwrap_or(""))
            .env("TRANSCACHE_RESOURCE_ROOTS", roots)
            .env("TRANSCACHE_CONFIGS", &self.configs)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Self::failed(old_name, format!("cannot run {}: {}", self.program, e)))?;

        // Feed stdin from another thread so a large artifact cannot deadlock
        // against a full stdout pipe.
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Self::failed(old_name, "stdin not captured"))?;
        let input = bytes.to_vec();
        let feeder = std::thread::spawn(move || stdin.write_all(&input));

        let output = child
            .wait_with_output()
            .map_err(|e| Self::failed(old_name, e.to_string()))?;
        match feeder.join() {
            Ok(Ok(())) => {}
            // The program may legitimately exit without reading everything.
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => return Err(Self::failed(old_name, e.to_string())),
            Err(_) => return Err(Self::failed(old_name, "stdin writer panicked")),
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(0) => Ok(output.stdout),
            Some(NOT_TRANSFORMABLE_EXIT) => Err(RewriteError::NotTransformable {
                name: old_name.to_string(),
                reason: stderr,
            }),
            _ => Err(Self::failed(
                old_name,
                format!("{} exited with {}: {}", self.program, output.status, stderr),
            )),
        }
    }
}

/// Pick the rewriter for a configured argv
pub fn from_config(argv: &[String]) -> Box<dyn Rewriter> {
    match CommandRewriter::from_argv(argv) {
        Some(cmd) => Box::new(cmd),
        None => Box::new(IdentityRewriter),
    }
}
