//! Integration tests for transcache

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    /// Command isolated from the user's config and cache
    fn transcache(tmp: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("transcache");
        cmd.env("TRANSCACHE_CONFIG", tmp.path().join("config.toml"))
            .env("TRANSCACHE_CACHE_DIR", tmp.path().join("cache"))
            .env("TRANSCACHE_PLAIN", "1")
            .env_remove("RUST_LOG");
        cmd
    }

    fn write(root: &Path, rel: &str, bytes: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    /// Two units with one artifact each, plus the manifest describing them
    fn manifest(tmp: &TempDir) -> std::path::PathBuf {
        write(tmp.path(), "units/a/com/a/A.class", b"class a");
        write(tmp.path(), "units/b/com/b/B.class", b"class b");
        let path = tmp.path().join("units.toml");
        fs::write(
            &path,
            r#"
[[unit]]
id = "a"
resource_root = "units/a"
hash = "aa"

[[unit]]
id = "b"
resource_root = "units/b"
hash = "bb"
"#,
        )
        .unwrap();
        path
    }

    #[test]
    fn help_displays() {
        let tmp = TempDir::new().unwrap();
        transcache(&tmp)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("cache for rewritten code artifacts"));
    }

    #[test]
    fn version_displays() {
        let tmp = TempDir::new().unwrap();
        transcache(&tmp)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("transcache"));
    }

    #[test]
    fn keys_prints_options_record() {
        let tmp = TempDir::new().unwrap();
        let units = manifest(&tmp);
        transcache(&tmp)
            .args(["keys", "--flag", "x=true", "--units"])
            .arg(&units)
            .assert()
            .success()
            .stdout(predicate::str::contains("flag:x=true\n"))
            .stdout(predicate::str::contains("unit#0=a\n"))
            .stdout(predicate::str::contains("unit:b=b bb\n"));
    }

    #[test]
    fn build_then_reuse() {
        let tmp = TempDir::new().unwrap();
        let units = manifest(&tmp);

        transcache(&tmp)
            .args(["build", "--units"])
            .arg(&units)
            .assert()
            .success()
            .stdout(predicate::str::contains("Transform cache written"));
        assert!(tmp.path().join("cache/files.zip").is_file());

        transcache(&tmp)
            .args(["build", "--units"])
            .arg(&units)
            .assert()
            .success()
            .stdout(predicate::str::contains("Reused transform cache"));
    }

    #[test]
    fn check_reports_changed_flag() {
        let tmp = TempDir::new().unwrap();
        let units = manifest(&tmp);

        transcache(&tmp)
            .args(["check", "--units"])
            .arg(&units)
            .assert()
            .failure()
            .stdout(predicate::str::contains("invalid: missing"));

        transcache(&tmp)
            .args(["build", "--flag", "x=true", "--units"])
            .arg(&units)
            .assert()
            .success();

        transcache(&tmp)
            .args(["check", "--flag", "x=true", "--units"])
            .arg(&units)
            .assert()
            .success()
            .stdout(predicate::str::contains("valid"));

        transcache(&tmp)
            .args(["check", "--flag", "x=false", "--units"])
            .arg(&units)
            .assert()
            .failure()
            .stdout(predicate::str::contains("~ flag:x: true -> false"));
    }

    #[test]
    fn show_lists_units() {
        let tmp = TempDir::new().unwrap();
        let units = manifest(&tmp);
        transcache(&tmp)
            .args(["build", "--units"])
            .arg(&units)
            .assert()
            .success();

        transcache(&tmp)
            .args(["show", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::eq("a\nb\n"));

        transcache(&tmp)
            .args(["show", "--unit", "a"])
            .assert()
            .success()
            .stdout(predicate::str::contains("com/a/A.class"));
    }

    #[test]
    fn clear_with_yes() {
        let tmp = TempDir::new().unwrap();
        let units = manifest(&tmp);
        transcache(&tmp)
            .args(["build", "--units"])
            .arg(&units)
            .assert()
            .success();

        transcache(&tmp).args(["clear", "--yes"]).assert().success();
        assert!(!tmp.path().join("cache/files.zip").exists());
    }

    #[test]
    fn missing_manifest_fails() {
        let tmp = TempDir::new().unwrap();
        transcache(&tmp)
            .args(["build", "--units", "does-not-exist.toml"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("unit manifest"));
    }

    #[test]
    fn config_path_and_show() {
        let tmp = TempDir::new().unwrap();
        transcache(&tmp)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));

        transcache(&tmp)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[cache]"));
    }

    #[test]
    fn config_set_then_show() {
        let tmp = TempDir::new().unwrap();
        transcache(&tmp)
            .args(["config", "set", "transform.flags.x", "true"])
            .assert()
            .success();
        let written = fs::read_to_string(tmp.path().join("config.toml")).unwrap();
        assert!(written.contains("x = true"));

        transcache(&tmp)
            .args(["config", "set", "no.such.key", "1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("unknown config key"));
    }
}

mod cache_tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;
    use transcache::cache::{
        BundleInputs, CacheOptions, InvalidReason, TransformCache, Validity,
    };
    use transcache::rewriter::{IdentityRewriter, RewriteContext, RewriteError, Rewriter};
    use transcache::{
        DependencyRecord, LoadUnit, TranscacheError, TranscacheResult, TransformCacheResult,
    };

    /// Appends a marker byte, refuses `refuse`, and counts invocations
    #[derive(Default)]
    struct Marking {
        refuse: Option<&'static str>,
        calls: usize,
    }

    impl Rewriter for Marking {
        fn transform(
            &mut self,
            _ctx: &RewriteContext<'_>,
            old_name: &str,
            _new_name: &str,
            bytes: &[u8],
        ) -> Result<Vec<u8>, RewriteError> {
            self.calls += 1;
            if Some(old_name) == self.refuse {
                return Err(RewriteError::NotTransformable {
                    name: old_name.to_string(),
                    reason: "unsupported".to_string(),
                });
            }
            let mut out = bytes.to_vec();
            out.extend_from_slice(b"+rw");
            Ok(out)
        }
    }

    struct Fixture {
        tmp: TempDir,
        units: Vec<LoadUnit>,
        flags: BTreeMap<String, bool>,
    }

    impl Fixture {
        /// Scenario setup: units {A:h1, B:h2}, flags {x:true}
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let a = unit_root(tmp.path(), "a", &["com/a/Good.class", "com/a/Odd.class"]);
            let b = unit_root(tmp.path(), "b", &["com/b/B.class"]);
            let units = vec![
                LoadUnit::new("a", a).with_content_hash(b"h1".to_vec()),
                LoadUnit::new("b", b).with_content_hash(b"h2".to_vec()),
            ];
            let flags = [("x".to_string(), true)].into_iter().collect();
            Self { tmp, units, flags }
        }

        fn folder(&self) -> PathBuf {
            self.tmp.path().join("cache")
        }

        fn cache(&self) -> TransformCache {
            TransformCache::new(self.folder(), CacheOptions::default())
        }

        fn build(&self, rewriter: &mut dyn Rewriter) -> TranscacheResult<TransformCacheResult> {
            self.build_with(&self.cache(), rewriter)
        }

        fn build_with(
            &self,
            cache: &TransformCache,
            rewriter: &mut dyn Rewriter,
        ) -> TranscacheResult<TransformCacheResult> {
            let solved = DependencyRecord::direct_from_units(&self.units);
            let inputs = BundleInputs {
                units: &self.units,
                solved: &solved,
                flags: &self.flags,
                unassociated: &[],
            };
            cache.populate_transform_bundle(&inputs, rewriter, &mut ())
        }
    }

    fn unit_root(base: &Path, id: &str, files: &[&str]) -> PathBuf {
        let root = base.join("units").join(id);
        for rel in files {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, rel.as_bytes()).unwrap();
        }
        root
    }

    #[test]
    fn scenario_a_unchanged_inputs_reuse() {
        let fx = Fixture::new();
        let first = fx.build(&mut Marking::default()).unwrap();
        assert!(first.newly_generated);

        let mut rewriter = Marking::default();
        let second = fx.build(&mut rewriter).unwrap();
        assert!(!second.newly_generated);
        assert_eq!(rewriter.calls, 0);
        assert_eq!(second.stats.copied_files, 0);
        assert_eq!(
            second.archive.read("a", "com/a/Good.class").unwrap(),
            Some(b"com/a/Good.class+rw".to_vec())
        );
    }

    #[test]
    fn scenario_b_flag_flip_rebuilds() {
        let mut fx = Fixture::new();
        fx.build(&mut IdentityRewriter).unwrap();

        fx.flags.insert("x".to_string(), false);
        let rebuilt = fx.build(&mut IdentityRewriter).unwrap();
        assert!(rebuilt.newly_generated);
        match rebuilt.invalidated {
            Some(InvalidReason::Mismatch(diff)) => {
                assert_eq!(diff.keys(), vec!["flag:x"]);
                assert_eq!(diff.changed.len(), 1);
            }
            other => panic!("expected a key mismatch, got {:?}", other),
        }
        let keys = rebuilt.archive.options().unwrap();
        assert_eq!(keys.get("flag:x"), Some("false"));
    }

    #[test]
    fn scenario_c_refused_artifact_unchanged() {
        let fx = Fixture::new();
        let mut rewriter = Marking {
            refuse: Some("com.a.Odd"),
            calls: 0,
        };
        let result = fx.build(&mut rewriter).unwrap();

        assert_eq!(result.stats.pipeline.not_transformable, 1);
        assert_eq!(
            result.archive.read("a", "com/a/Odd.class").unwrap(),
            Some(b"com/a/Odd.class".to_vec())
        );
        assert_eq!(
            result.archive.read("b", "com/b/B.class").unwrap(),
            Some(b"com/b/B.class+rw".to_vec())
        );
    }

    #[test]
    fn scenario_d_io_failure_is_fatal_and_recoverable() {
        let mut fx = Fixture::new();
        fx.build(&mut IdentityRewriter).unwrap();

        // b's resource root vanishes after a has been copied
        let b_root = fx.units[1].resource_root.clone();
        fx.units[1] = LoadUnit::new("b", fx.tmp.path().join("vanished"))
            .with_content_hash(b"h3".to_vec());
        let err = fx.build(&mut IdentityRewriter).unwrap_err();
        assert!(matches!(err, TranscacheError::ArtifactIo { .. }));

        let store = fx.cache().store().clone();
        assert!(store.open().is_none());
        assert!(!fx.folder().join("staging").exists());

        fx.units[1] = LoadUnit::new("b", b_root).with_content_hash(b"h3".to_vec());
        let recovered = fx.build(&mut IdentityRewriter).unwrap();
        assert!(recovered.newly_generated);
        assert_eq!(recovered.invalidated, Some(InvalidReason::Missing));
    }

    #[test]
    fn idempotent_archive_bytes() {
        let fx = Fixture::new();
        fx.build(&mut IdentityRewriter).unwrap();
        let first = fs::read(fx.folder().join("files.zip")).unwrap();

        let options = CacheOptions {
            development: true,
            ..CacheOptions::default()
        };
        let solved = DependencyRecord::direct_from_units(&fx.units);
        let inputs = BundleInputs {
            units: &fx.units,
            solved: &solved,
            flags: &fx.flags,
            unassociated: &[],
        };
        let rebuilt = TransformCache::new(fx.folder(), options)
            .populate_transform_bundle(&inputs, &mut IdentityRewriter, &mut ())
            .unwrap();
        assert_eq!(rebuilt.invalidated, Some(InvalidReason::Development));

        let second = fs::read(fx.folder().join("files.zip")).unwrap();
        assert_eq!(first, second);
    }

    fn check(fx: &Fixture) -> Validity {
        let solved = DependencyRecord::direct_from_units(&fx.units);
        let inputs = BundleInputs {
            units: &fx.units,
            solved: &solved,
            flags: &fx.flags,
            unassociated: &[],
        };
        fx.cache().check(&inputs).unwrap()
    }

    #[test]
    fn sensitivity_to_hash_and_order() {
        let mut fx = Fixture::new();
        fx.build(&mut IdentityRewriter).unwrap();
        assert_eq!(check(&fx), Validity::Valid);

        fx.units[0].content_hash = Some(b"h1-changed".to_vec());
        match check(&fx) {
            Validity::Invalid(InvalidReason::Mismatch(diff)) => {
                assert_eq!(diff.keys(), vec!["unit:a"])
            }
            other => panic!("expected mismatch, got {:?}", other),
        }

        fx.units[0].content_hash = Some(b"h1".to_vec());
        fx.units.swap(0, 1);
        match check(&fx) {
            Validity::Invalid(InvalidReason::Mismatch(diff)) => {
                assert_eq!(diff.keys(), vec!["unit#0", "unit#1"])
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[test]
    fn truncated_archive_is_rebuilt() {
        let fx = Fixture::new();
        fx.build(&mut IdentityRewriter).unwrap();

        let archive = fx.folder().join("files.zip");
        let bytes = fs::read(&archive).unwrap();
        fs::write(&archive, &bytes[..bytes.len() - 10]).unwrap();

        let rebuilt = fx.build(&mut IdentityRewriter).unwrap();
        assert!(rebuilt.newly_generated);
        assert!(matches!(rebuilt.invalidated, Some(InvalidReason::Corrupt(_))));
    }

    #[test]
    fn archive_without_marker_is_rebuilt() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.folder()).unwrap();

        // A torn write that got as far as the options record
        let file = fs::File::create(fx.folder().join("files.zip")).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("a/com/a/Good.class", options).unwrap();
        writer.write_all(b"stale").unwrap();
        writer.start_file("options.txt", options).unwrap();
        writer.write_all(b"flag:x=true\n").unwrap();
        writer.finish().unwrap();

        let rebuilt = fx.build(&mut IdentityRewriter).unwrap();
        assert!(matches!(rebuilt.invalidated, Some(InvalidReason::Corrupt(_))));
        assert_eq!(
            rebuilt.archive.read("a", "com/a/Good.class").unwrap(),
            Some(b"com/a/Good.class".to_vec())
        );
    }

    #[test]
    fn leftovers_of_interrupted_build_are_ignored() {
        let fx = Fixture::new();
        write_leftovers(&fx.folder());

        let built = fx.build(&mut IdentityRewriter).unwrap();
        assert_eq!(built.invalidated, Some(InvalidReason::Missing));
        assert!(!fx.folder().join("files.zip.partial").exists());
        assert!(!fx.folder().join("staging").exists());
        assert_eq!(built.archive.unit_ids(), vec!["a".to_string(), "b".to_string()]);
    }

    fn write_leftovers(folder: &Path) {
        fs::create_dir_all(folder.join("staging/a/com/a")).unwrap();
        fs::write(folder.join("staging/a/com/a/Stale.class"), b"stale").unwrap();
        fs::write(folder.join("files.zip.partial"), b"torn").unwrap();
    }

    #[test]
    fn hash_failure_before_touching_archive() {
        let mut fx = Fixture::new();
        fx.build(&mut IdentityRewriter).unwrap();

        fx.units[0] = LoadUnit::new("a", fx.tmp.path().join("units/a"))
            .with_origin(fx.tmp.path().join("missing.jar"));
        let err = fx.build(&mut IdentityRewriter).unwrap_err();
        assert!(matches!(err, TranscacheError::HashComputation { .. }));
        assert!(fx.cache().store().open().is_some());
    }

    #[test]
    fn foreign_entries_survive_rebuild() {
        let mut fx = Fixture::new();
        // Cache folder shared with the unit sources
        let shared = fx.tmp.path().to_path_buf();
        fs::write(shared.join("notes.txt"), b"keep me").unwrap();
        let cache = TransformCache::new(&shared, CacheOptions::default());
        fx.build_with(&cache, &mut IdentityRewriter).unwrap();

        fx.flags.insert("x".to_string(), false);
        let rebuilt = fx.build_with(&cache, &mut IdentityRewriter).unwrap();
        assert!(rebuilt.newly_generated);
        assert_eq!(fs::read(shared.join("notes.txt")).unwrap(), b"keep me");
        assert!(shared.join("units/a/com/a/Good.class").is_file());
        assert_eq!(
            rebuilt.archive.read("b", "com/b/B.class").unwrap(),
            Some(b"com/b/B.class".to_vec())
        );
    }

    #[test]
    fn erase_failure_is_fatal_and_keeps_read_error() {
        let fx = Fixture::new();
        fx.build(&mut IdentityRewriter).unwrap();

        let archive = fx.folder().join("files.zip");
        let bytes = fs::read(&archive).unwrap();
        fs::write(&archive, &bytes[..bytes.len() / 2]).unwrap();
        // Unlinking a directory fails regardless of privileges
        fs::create_dir_all(fx.folder().join("files.zip.partial/blocker")).unwrap();

        match fx.build(&mut IdentityRewriter) {
            Err(TranscacheError::EraseFailed {
                path, suppressed, ..
            }) => {
                assert_eq!(path, fx.folder().join("files.zip.partial"));
                assert!(suppressed.is_some());
            }
            other => panic!("expected erase failure, got {:?}", other.map(|r| r.folder)),
        }
    }

    #[test]
    fn changed_keys_rebuild_with_and_without_detail_logging() {
        for log_changed_keys in [false, true] {
            let mut fx = Fixture::new();
            let cache = TransformCache::new(
                fx.folder(),
                CacheOptions {
                    log_changed_keys,
                    ..CacheOptions::default()
                },
            );
            fx.build_with(&cache, &mut IdentityRewriter).unwrap();

            fx.flags.insert("x".to_string(), false);
            fx.flags.insert("y".to_string(), true);
            let rebuilt = fx.build_with(&cache, &mut IdentityRewriter).unwrap();
            match rebuilt.invalidated {
                Some(InvalidReason::Mismatch(diff)) => {
                    assert_eq!(diff.keys(), vec!["flag:x", "flag:y"])
                }
                other => panic!("expected a key mismatch, got {:?}", other),
            }
        }
    }
}
