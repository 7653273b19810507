//! Manifest-driven runs.
//!
//! Tests that load a YAML node manifest from disk, build its tasks and
//! converge them.

use crate::common::fast_options;
use converge::testing::SharedBuffer;
use converge::{
    ConfigError, ConvergenceContext, DependencyGraph, DirectTarget, GraphError, ManifestLoader,
    ScriptTarget, TargetKind,
};
use std::path::Path;
use tempfile::TempDir;

fn write_manifest(dir: &Path, yaml: &str) -> std::path::PathBuf {
    let path = dir.join("node.yaml");
    std::fs::write(&path, yaml).unwrap();
    path
}

#[tokio::test]
async fn test_manifest_converges_direct() {
    let root = TempDir::new().unwrap();
    let yaml = format!(
        r#"
target: direct
fs_root: {root}
cache_dir: /var/cache/converge
pass_delay_secs: 0
tasks:
  - id: motd
    type: file
    path: /etc/motd
    contents: "managed by converge\n"
    depends_on: [etc]
  - id: etc
    type: directory
    path: /etc
"#,
        root = root.path().display()
    );
    let manifest = write_manifest(root.path(), &yaml);

    let (config, tasks) = ManifestLoader::load_tasks(&manifest).unwrap();
    assert_eq!(config.target, TargetKind::Direct);

    let ctx = ConvergenceContext::new(
        Box::new(DirectTarget::new(&config.fs_root)),
        config.target.checks_existing(),
        config.run_options().unwrap(),
    );
    let report = ctx.converge(&tasks).await.unwrap();

    assert_eq!(report.passes, 2);
    assert_eq!(
        std::fs::read_to_string(root.path().join("etc/motd")).unwrap(),
        "managed by converge\n"
    );
}

#[tokio::test]
async fn test_manifest_renders_images_into_script() {
    let dir = TempDir::new().unwrap();
    let manifest = write_manifest(
        dir.path(),
        r#"
target: script
script_format: shell
cache_dir: /var/cache/converge
images:
  - source: https://example.com/images/pause.tar
    hash: 0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef
tasks:
  - id: start
    type: command
    command: systemctl
    args: [start, kubelet]
    depends_on: [LoadImage.0]
"#,
    );

    let (config, tasks) = ManifestLoader::load_tasks(&manifest).unwrap();
    let out = SharedBuffer::new();
    let ctx = ConvergenceContext::new(
        Box::new(ScriptTarget::new(config.script_format, out.clone())),
        config.target.checks_existing(),
        fast_options(3),
    );
    ctx.converge(&tasks).await.unwrap();

    let script = out.contents();
    let lines: Vec<&str> = script.lines().collect();
    assert_eq!(lines[0], "#!/bin/sh");
    assert!(script.contains("sha256sum -c --status -"));
    assert!(script.contains("docker load -i /var/cache/converge/pause.tar"));
    assert_eq!(lines.last().copied(), Some("systemctl start kubelet"));
}

#[test]
fn test_manifest_cycle_is_found_by_graph() {
    let yaml = r#"
cache_dir: /c
tasks:
  - id: x
    type: directory
    path: /x
    depends_on: [y]
  - id: y
    type: directory
    path: /y
    depends_on: [x]
"#;
    let config = ManifestLoader::parse(yaml).unwrap();
    let tasks = ManifestLoader::build_tasks(&config).unwrap();

    let err = DependencyGraph::build(&tasks).unwrap_err();

    assert!(matches!(err, GraphError::CycleDetected { .. }));
}

#[test]
fn test_manifest_missing_cache_dir() {
    let dir = TempDir::new().unwrap();
    let manifest = write_manifest(dir.path(), "target: direct\n");

    let err = ManifestLoader::load(&manifest).unwrap_err();
    assert!(matches!(err, ConfigError::MissingField(_)));

    // An override supplied before validation makes it usable.
    let mut config = ManifestLoader::read(&manifest).unwrap();
    config.cache_dir = Some("/var/cache/converge".into());
    assert!(config.validate().is_ok());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_plan_reuses_verified_cache() {
    use converge::DryRunTarget;

    let cache = TempDir::new().unwrap();
    std::fs::write(cache.path().join("cni.tgz"), "").unwrap();
    let yaml = format!(
        r#"
target: dryrun
cache_dir: {cache}
assets:
  - source: https://example.com/cni.tgz
    hash: e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855
tasks:
  - id: unpack
    type: command
    command: tar
    args: [xzf, {cache}/cni.tgz]
    depends_on: [Asset.0]
"#,
        cache = cache.path().display()
    );
    let config = ManifestLoader::parse(&yaml).unwrap();
    let tasks = ManifestLoader::build_tasks(&config).unwrap();
    let out = SharedBuffer::new();

    let ctx = ConvergenceContext::new(
        Box::new(DryRunTarget::new(&config.fs_root, out.clone())),
        config.target.checks_existing(),
        fast_options(3),
    );
    let report = ctx.converge(&tasks).await.unwrap();

    assert_eq!(report.passes, 2);
    let plan = out.contents();
    assert!(plan.starts_with("Will make 1 change(s):\n"));
    assert!(plan.contains("run tar xzf"));
    assert!(!plan.contains("curl"));
}

#[test]
fn test_fs_root_override_rejects_host_downloads() {
    let dir = TempDir::new().unwrap();
    let manifest = write_manifest(
        dir.path(),
        r#"
cache_dir: /var/cache/converge
images:
  - source: https://example.com/pause.tar
    hash: 0123456789abcdef0123456789abcdef01234567
"#,
    );

    let mut config = ManifestLoader::read(&manifest).unwrap();
    assert!(config.validate().is_ok());

    config.fs_root = "/mnt/image".into();
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidConfig(_))
    ));
}
