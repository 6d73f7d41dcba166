//! Cross-unit visibility widening
//!
//! Rewritten code of one unit may reach into classes of another unit. The
//! scan pass collects every such reference into a [`WideningPatch`]; the
//! rewrite pass then makes the referenced classes and members public and
//! records their original access flags.

use crate::cache::classfile::{self, ClassFile, MemberKind};
use crate::cache::populate::{ArtifactEntry, ArtifactIndex};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Symbols that must become public, accumulated over the whole corpus
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WideningPatch {
    classes: BTreeSet<String>,
    members: BTreeMap<String, BTreeSet<(String, String)>>,
}

/// Bytes after widening, plus one metadata line per widened symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Widened {
    pub bytes: Vec<u8>,
    pub records: Vec<String>,
}

impl WideningPatch {
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn member_count(&self) -> usize {
        self.members.values().map(BTreeSet::len).sum()
    }

    pub fn contains_class(&self, internal_name: &str) -> bool {
        self.classes.contains(internal_name)
    }

    pub fn contains_member(&self, owner: &str, name: &str, descriptor: &str) -> bool {
        self.members
            .get(owner)
            .is_some_and(|m| m.contains(&(name.to_string(), descriptor.to_string())))
    }

    /// Record every reference `entry` makes into a class of another owner
    ///
    /// Returns `false` if the bytes are not a readable class file.
    pub fn scan(&mut self, entry: &ArtifactEntry, bytes: &[u8], index: &ArtifactIndex) -> bool {
        let class = match ClassFile::parse(bytes) {
            Ok(class) => class,
            Err(e) => {
                debug!("Not scanning {}: {}", entry.qualified_name, e);
                return false;
            }
        };

        let foreign = |name: &str| {
            index
                .get(name)
                .is_some_and(|target| target.owner != entry.owner)
        };

        for name in class.class_refs() {
            if foreign(name) {
                self.classes.insert(name.to_string());
            }
        }
        for member in class.member_refs() {
            if foreign(&member.owner) {
                self.classes.insert(member.owner.clone());
                self.members
                    .entry(member.owner)
                    .or_default()
                    .insert((member.name, member.descriptor));
            }
        }
        true
    }

    /// Widen the class in `bytes` if it or any of its members was referenced
    ///
    /// Returns `None` when nothing changes, including bytes that do not parse.
    pub fn apply(&self, bytes: &[u8]) -> Option<Widened> {
        let class = ClassFile::parse(bytes).ok()?;
        let name = class.this_name().ok()?;
        if !self.classes.contains(name) {
            return None;
        }

        let mut out = bytes.to_vec();
        let mut records = Vec::new();

        let widened = classfile::widen(class.access());
        if widened != class.access() {
            classfile::write_u16(&mut out, class.access_offset(), widened);
            records.push(format!("class {} {:#06x}", name, class.access()));
        }

        if let Some(wanted) = self.members.get(name) {
            for member in class.members() {
                if !wanted.contains(&(member.name.clone(), member.descriptor.clone())) {
                    continue;
                }
                let widened = classfile::widen(member.access);
                if widened == member.access {
                    continue;
                }
                classfile::write_u16(&mut out, member.access_offset(), widened);
                let kind = match member.kind {
                    MemberKind::Field => "field",
                    MemberKind::Method => "method",
                };
                records.push(format!(
                    "{} {} {} {} {:#06x}",
                    kind, name, member.name, member.descriptor, member.access
                ));
            }
        }

        if records.is_empty() {
            None
        } else {
            Some(Widened {
                bytes: out,
                records,
            })
        }
    }
}
