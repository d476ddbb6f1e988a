//! End-to-end tests for the update pipeline: real archives, real hook
//! scripts, real file placement, all inside per-test temp roots.

use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use tempfile::TempDir;

use ota_core::builder::PackageBuilder;
use ota_core::{Engine, UpdateError, crypto};
use ota_schema::{MANIFEST_FILENAME, SIGNATURE_FILENAME, ScriptKind};

const TEST_PRIVATE_KEY: &str = include_str!("keys/test_private.pem");
const TEST_PUBLIC_KEY: &str = include_str!("keys/test_public.pem");
const OTHER_PUBLIC_KEY: &str = include_str!("keys/other_public.pem");

/// Per-test sandbox: an install root for destinations, a staging root the
/// engine is pointed at (so cleanup is observable), and a hook log.
struct TestContext {
    root: TempDir,
}

impl TestContext {
    fn new() -> Self {
        let root = TempDir::new().expect("failed to create test root");
        std::fs::create_dir_all(root.path().join("staging")).unwrap();
        std::fs::create_dir_all(root.path().join("install")).unwrap();
        Self { root }
    }

    fn staging_root(&self) -> PathBuf {
        self.root.path().join("staging")
    }

    fn install_dir(&self) -> PathBuf {
        self.root.path().join("install")
    }

    fn hook_log(&self) -> PathBuf {
        self.root.path().join("hooks.log")
    }

    fn engine(&self) -> Engine {
        Engine::new(None).with_staging_root(self.staging_root())
    }

    fn engine_with_anchor(&self, pem: &str) -> Engine {
        let anchor = crypto::parse_public_key(pem).unwrap();
        Engine::new(Some(anchor)).with_staging_root(self.staging_root())
    }

    /// The staging root must be empty after every apply, success or not.
    fn assert_staging_clean(&self) {
        let leftovers: Vec<_> = std::fs::read_dir(self.staging_root())
            .unwrap()
            .collect();
        assert!(
            leftovers.is_empty(),
            "staging directory not cleaned up: {leftovers:?}"
        );
    }

    fn logged_hooks(&self) -> Vec<String> {
        match std::fs::read_to_string(self.hook_log()) {
            Ok(content) => content.lines().map(str::to_string).collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Build a gzip'd tar package from (name, data, mode) entries.
fn package(entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut archive = tar::Builder::new(encoder);
    for (name, data, mode) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(*mode);
        archive.append_data(&mut header, name, *data).unwrap();
    }
    archive.into_inner().unwrap().finish().unwrap()
}

fn manifest_json(files: &[(&str, &str, &str)], scripts: &[(&str, &str)]) -> Vec<u8> {
    let files: Vec<_> = files
        .iter()
        .map(|(filename, path, sha256)| {
            serde_json::json!({
                "filename": filename, "path": path, "md5": "", "sha256": sha256
            })
        })
        .collect();
    let scripts: Vec<_> = scripts
        .iter()
        .map(|(filename, kind)| {
            serde_json::json!({
                "filename": filename, "type": kind, "md5": "", "sha256": ""
            })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({
        "name": "test-update",
        "version": "1.0.0",
        "description": "fixture",
        "reboot": false,
        "files": files,
        "scripts": scripts,
    }))
    .unwrap()
}

fn sha256_of(data: &[u8]) -> String {
    crypto::sha256_hex(data).unwrap()
}

/// A stub hook that appends `name` to the log, but only when `guard`
/// (a shell condition) holds.
fn guarded_script(name: &str, guard: &str, log: &Path) -> Vec<u8> {
    format!(
        "#!/bin/sh\nif {guard}; then echo {name} >> {log}; fi\n",
        log = log.display()
    )
    .into_bytes()
}

fn logging_script(name: &str, log: &Path) -> Vec<u8> {
    format!("#!/bin/sh\necho {name} >> {log}\n", log = log.display()).into_bytes()
}

#[tokio::test]
async fn concrete_scenario_applies_file_and_runs_post_hook() {
    let ctx = TestContext::new();
    let dest = ctx.install_dir().join("app.bin");

    let payload: &[u8] = b"new firmware bytes";
    let manifest = manifest_json(
        &[("app.bin", dest.to_str().unwrap(), &sha256_of(payload))],
        &[("restart.sh", "postinstall")],
    );
    let archive = package(&[
        (MANIFEST_FILENAME, &manifest, 0o644),
        ("app.bin", payload, 0o644),
        ("restart.sh", &logging_script("restart", &ctx.hook_log()), 0o755),
    ]);

    let outcome = ctx.engine().apply(archive.as_slice()).await.unwrap();

    assert_eq!(outcome.name, "test-update");
    assert_eq!(outcome.version, "1.0.0");
    assert!(!outcome.reboot_required);
    assert_eq!(std::fs::read(&dest).unwrap(), payload);
    assert_eq!(ctx.logged_hooks(), vec!["restart"]);
    ctx.assert_staging_clean();
}

#[tokio::test]
async fn hooks_and_copies_run_in_declared_order() {
    let ctx = TestContext::new();
    let dest = ctx.install_dir().join("app.bin");
    let dest_str = dest.display().to_string();
    let log = ctx.hook_log();

    let payload: &[u8] = b"ordered payload";
    let manifest = manifest_json(
        &[("app.bin", &dest_str, "")],
        &[
            ("a.sh", "preinstall"),
            ("b.sh", "preinstall"),
            ("c.sh", "postinstall"),
            ("d.sh", "postinstall"),
        ],
    );

    // Pre-install hooks log only while the payload is NOT yet in place;
    // post-install hooks only once it is. Any ordering violation drops a
    // line from the log.
    let absent = format!("[ ! -f {dest_str} ]");
    let present = format!("[ -f {dest_str} ]");
    let archive = package(&[
        (MANIFEST_FILENAME, &manifest, 0o644),
        ("app.bin", payload, 0o644),
        ("a.sh", &guarded_script("A", &absent, &log), 0o755),
        ("b.sh", &guarded_script("B", &absent, &log), 0o755),
        ("c.sh", &guarded_script("C", &present, &log), 0o755),
        ("d.sh", &guarded_script("D", &present, &log), 0o755),
    ]);

    ctx.engine().apply(archive.as_slice()).await.unwrap();

    assert_eq!(ctx.logged_hooks(), vec!["A", "B", "C", "D"]);
    ctx.assert_staging_clean();
}

#[tokio::test]
async fn checksum_mismatch_aborts_before_any_side_effect() {
    let ctx = TestContext::new();
    let dest = ctx.install_dir().join("app.bin");

    let manifest = manifest_json(
        &[(
            "app.bin",
            dest.to_str().unwrap(),
            // Digest of different bytes.
            &sha256_of(b"something else entirely"),
        )],
        &[("pre.sh", "preinstall")],
    );
    let archive = package(&[
        (MANIFEST_FILENAME, &manifest, 0o644),
        ("app.bin", b"actual payload", 0o644),
        ("pre.sh", &logging_script("pre", &ctx.hook_log()), 0o755),
    ]);

    let err = ctx.engine().apply(archive.as_slice()).await.unwrap_err();

    assert!(matches!(
        err,
        UpdateError::ChecksumMismatch { ref filename, .. } if filename == "app.bin"
    ));
    assert!(!dest.exists(), "no file may be copied after a mismatch");
    assert!(ctx.logged_hooks().is_empty(), "no hook may run after a mismatch");
    ctx.assert_staging_clean();
}

#[tokio::test]
async fn md5_is_verified_when_declared() {
    let ctx = TestContext::new();
    let dest = ctx.install_dir().join("app.bin");

    let manifest = serde_json::to_vec(&serde_json::json!({
        "name": "test-update", "version": "1.0.0",
        "files": [{
            "filename": "app.bin",
            "path": dest.to_str().unwrap(),
            "md5": "00000000000000000000000000000000",
            "sha256": ""
        }],
        "scripts": [],
    }))
    .unwrap();
    let archive = package(&[
        (MANIFEST_FILENAME, &manifest, 0o644),
        ("app.bin", b"payload", 0o644),
    ]);

    let err = ctx.engine().apply(archive.as_slice()).await.unwrap_err();
    assert!(matches!(
        err,
        UpdateError::ChecksumMismatch { algorithm: "md5", .. }
    ));
}

#[tokio::test]
async fn unsigned_package_is_accepted_with_and_without_anchor() {
    for with_anchor in [false, true] {
        let ctx = TestContext::new();
        let dest = ctx.install_dir().join("app.bin");
        let payload: &[u8] = b"unsigned payload";
        let manifest = manifest_json(
            &[("app.bin", dest.to_str().unwrap(), &sha256_of(payload))],
            &[],
        );
        let archive = package(&[
            (MANIFEST_FILENAME, &manifest, 0o644),
            ("app.bin", payload, 0o644),
        ]);

        let engine = if with_anchor {
            ctx.engine_with_anchor(TEST_PUBLIC_KEY)
        } else {
            ctx.engine()
        };
        engine.apply(archive.as_slice()).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), payload);
    }
}

#[tokio::test]
async fn signed_package_without_anchor_is_rejected() {
    let ctx = TestContext::new();
    let manifest = manifest_json(&[], &[]);
    let key = crypto::parse_private_key(TEST_PRIVATE_KEY).unwrap();
    let signature = crypto::sign(&manifest, &key).unwrap();

    let archive = package(&[
        (MANIFEST_FILENAME, &manifest, 0o644),
        (SIGNATURE_FILENAME, signature.as_bytes(), 0o644),
    ]);

    let err = ctx.engine().apply(archive.as_slice()).await.unwrap_err();
    assert!(matches!(err, UpdateError::TrustAnchorMissing));
    ctx.assert_staging_clean();
}

#[tokio::test]
async fn signed_package_verifies_against_the_anchor() {
    let ctx = TestContext::new();
    let manifest = manifest_json(&[], &[]);
    let key = crypto::parse_private_key(TEST_PRIVATE_KEY).unwrap();
    let signature = crypto::sign(&manifest, &key).unwrap();

    let archive = package(&[
        (MANIFEST_FILENAME, &manifest, 0o644),
        (SIGNATURE_FILENAME, signature.as_bytes(), 0o644),
    ]);

    // Matching anchor: accepted.
    ctx.engine_with_anchor(TEST_PUBLIC_KEY)
        .apply(archive.as_slice())
        .await
        .unwrap();

    // Unrelated anchor: rejected.
    let err = ctx
        .engine_with_anchor(OTHER_PUBLIC_KEY)
        .apply(archive.as_slice())
        .await
        .unwrap_err();
    assert!(matches!(err, UpdateError::SignatureInvalid));
}

#[tokio::test]
async fn tampered_manifest_fails_signature_verification() {
    let ctx = TestContext::new();
    let manifest = manifest_json(&[], &[]);
    let key = crypto::parse_private_key(TEST_PRIVATE_KEY).unwrap();
    let signature = crypto::sign(&manifest, &key).unwrap();

    // Repackage with an edited manifest but the original signature.
    let mut tampered = manifest.clone();
    let pos = tampered.iter().position(|b| *b == b'1').unwrap();
    tampered[pos] = b'2';

    let archive = package(&[
        (MANIFEST_FILENAME, &tampered, 0o644),
        (SIGNATURE_FILENAME, signature.as_bytes(), 0o644),
    ]);

    let err = ctx
        .engine_with_anchor(TEST_PUBLIC_KEY)
        .apply(archive.as_slice())
        .await
        .unwrap_err();
    assert!(matches!(err, UpdateError::SignatureInvalid));
}

#[tokio::test]
async fn missing_manifest_is_fatal() {
    let ctx = TestContext::new();
    let archive = package(&[("stray.bin", b"data".as_slice(), 0o644)]);

    let err = ctx.engine().apply(archive.as_slice()).await.unwrap_err();
    assert!(matches!(err, UpdateError::ManifestMissing));
    ctx.assert_staging_clean();
}

#[tokio::test]
async fn malformed_manifest_is_a_parse_error() {
    let ctx = TestContext::new();
    let archive = package(&[(MANIFEST_FILENAME, b"{not json".as_slice(), 0o644)]);

    let err = ctx.engine().apply(archive.as_slice()).await.unwrap_err();
    assert!(matches!(err, UpdateError::ManifestParse(_)));
}

#[tokio::test]
async fn declared_but_absent_payload_is_rejected() {
    let ctx = TestContext::new();
    let manifest = manifest_json(&[("ghost.bin", "/opt/ghost", "")], &[]);
    let archive = package(&[(MANIFEST_FILENAME, &manifest, 0o644)]);

    let err = ctx.engine().apply(archive.as_slice()).await.unwrap_err();
    assert!(matches!(
        err,
        UpdateError::MissingPayload { ref filename } if filename == "ghost.bin"
    ));
}

#[tokio::test]
async fn unrecognized_script_kind_is_rejected() {
    let ctx = TestContext::new();
    let manifest = manifest_json(&[], &[("weird.sh", "midinstall")]);
    let archive = package(&[
        (MANIFEST_FILENAME, &manifest, 0o644),
        ("weird.sh", b"#!/bin/sh\n", 0o755),
    ]);

    let err = ctx.engine().apply(archive.as_slice()).await.unwrap_err();
    assert!(matches!(
        err,
        UpdateError::InvalidScriptKind { ref kind, .. } if kind == "midinstall"
    ));
}

#[tokio::test]
async fn relative_destination_is_rejected() {
    let ctx = TestContext::new();
    let manifest = manifest_json(&[("app.bin", "relative/dest", "")], &[]);
    let archive = package(&[
        (MANIFEST_FILENAME, &manifest, 0o644),
        ("app.bin", b"payload", 0o644),
    ]);

    let err = ctx.engine().apply(archive.as_slice()).await.unwrap_err();
    assert!(matches!(err, UpdateError::UnsafeDestination { .. }));
}

#[tokio::test]
async fn climbing_destination_is_rejected() {
    let ctx = TestContext::new();
    let manifest = manifest_json(&[("app.bin", "/opt/../../etc/shadow", "")], &[]);
    let archive = package(&[
        (MANIFEST_FILENAME, &manifest, 0o644),
        ("app.bin", b"payload", 0o644),
    ]);

    let err = ctx.engine().apply(archive.as_slice()).await.unwrap_err();
    assert!(matches!(err, UpdateError::UnsafeDestination { .. }));
}

#[tokio::test]
async fn failing_hook_does_not_abort_the_run() {
    let ctx = TestContext::new();
    let dest = ctx.install_dir().join("app.bin");
    let payload: &[u8] = b"payload";

    let manifest = manifest_json(
        &[("app.bin", dest.to_str().unwrap(), "")],
        &[("bad.sh", "preinstall"), ("post.sh", "postinstall")],
    );
    let archive = package(&[
        (MANIFEST_FILENAME, &manifest, 0o644),
        ("app.bin", payload, 0o644),
        ("bad.sh", b"#!/bin/sh\nexit 7\n", 0o755),
        ("post.sh", &logging_script("post", &ctx.hook_log()), 0o755),
    ]);

    ctx.engine().apply(archive.as_slice()).await.unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), payload);
    assert_eq!(ctx.logged_hooks(), vec!["post"]);
}

#[tokio::test]
async fn traversal_entry_aborts_and_cleans_up() {
    let ctx = TestContext::new();

    // Hostile name written into the raw header, bypassing tar-rs checks.
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut archive = tar::Builder::new(encoder);
    let mut header = tar::Header::new_gnu();
    let name = b"../../escape.txt";
    header.as_old_mut().name[..name.len()].copy_from_slice(name);
    header.set_size(4);
    header.set_mode(0o644);
    header.set_cksum();
    archive.append(&header, &b"evil"[..]).unwrap();
    let bytes = archive.into_inner().unwrap().finish().unwrap();

    let err = ctx.engine().apply(bytes.as_slice()).await.unwrap_err();
    assert!(matches!(err, UpdateError::Extraction(_)));
    assert!(!ctx.root.path().join("escape.txt").exists());
    ctx.assert_staging_clean();
}

#[tokio::test]
async fn reboot_flag_round_trips_to_the_outcome() {
    let ctx = TestContext::new();
    let manifest = serde_json::to_vec(&serde_json::json!({
        "name": "kernel-update", "version": "2.0.0", "reboot": true,
        "files": [], "scripts": [],
    }))
    .unwrap();
    let archive = package(&[(MANIFEST_FILENAME, &manifest, 0o644)]);

    let outcome = ctx.engine().apply(archive.as_slice()).await.unwrap();
    assert!(outcome.reboot_required);
    assert_eq!(outcome.name, "kernel-update");
}

#[tokio::test]
async fn built_package_round_trips_through_apply() {
    let ctx = TestContext::new();
    let dest = ctx.install_dir().join("tool");

    // Author a package with the builder...
    let src_dir = TempDir::new().unwrap();
    let payload_src = src_dir.path().join("tool");
    std::fs::write(&payload_src, b"tool bytes").unwrap();
    let script_src = src_dir.path().join("announce.sh");
    std::fs::write(&script_src, logging_script("announce", &ctx.hook_log())).unwrap();

    let output = src_dir.path().join("update.tar.gz");
    PackageBuilder::new("tool-update", "3.1.4")
        .description("ships one tool")
        .payload(&payload_src, dest.to_str().unwrap())
        .script(&script_src, ScriptKind::PostInstall)
        .signing_key(crypto::parse_private_key(TEST_PRIVATE_KEY).unwrap())
        .write_to(&output)
        .unwrap();

    // ...and apply it through the signed path.
    let outcome = ctx
        .engine_with_anchor(TEST_PUBLIC_KEY)
        .apply_from_path(&output)
        .await
        .unwrap();

    assert_eq!(outcome.name, "tool-update");
    assert_eq!(std::fs::read(&dest).unwrap(), b"tool bytes");
    assert_eq!(ctx.logged_hooks(), vec!["announce"]);
    ctx.assert_staging_clean();
}

#[tokio::test]
async fn unsigned_built_package_applies_without_anchor() {
    let ctx = TestContext::new();
    let dest = ctx.install_dir().join("tool");

    let src_dir = TempDir::new().unwrap();
    let payload_src = src_dir.path().join("tool");
    std::fs::write(&payload_src, b"tool bytes").unwrap();

    let output = src_dir.path().join("update.tar.gz");
    PackageBuilder::new("tool-update", "3.1.4")
        .payload(&payload_src, dest.to_str().unwrap())
        .write_to(&output)
        .unwrap();

    ctx.engine().apply_from_path(&output).await.unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), b"tool bytes");
}
