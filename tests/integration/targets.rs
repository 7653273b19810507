//! The same task collection converged against each target.
//!
//! Direct changes the filesystem once and is a no-op afterwards, DryRun
//! reports without touching anything, and ScriptRender produces a script
//! that performs the same work.

use crate::common::{fast_options, task_map};
use converge::tasks::{CommandTask, DirectoryTask, FileTask};
use converge::testing::SharedBuffer;
use converge::{
    ConvergenceContext, DirectTarget, DryRunTarget, ScriptFormat, ScriptTarget, Task, TaskMap,
    TaskRef,
};
use std::sync::Arc;
use tempfile::TempDir;

fn node_tasks() -> TaskMap {
    task_map(vec![
        Arc::new(DirectoryTask::new("app-dir", "/etc/app").mode(0o755)),
        Arc::new(
            FileTask::new("app-config", "/etc/app/config.yaml", "debug: false\n")
                .mode(0o644)
                .depends_on(TaskRef::to("app-dir")),
        ) as Arc<dyn Task>,
    ])
}

#[tokio::test]
async fn test_direct_converges_then_is_idempotent() {
    let root = TempDir::new().unwrap();
    let tasks = node_tasks();

    let ctx = ConvergenceContext::new(
        Box::new(DirectTarget::new(root.path())),
        true,
        fast_options(3),
    );
    let report = ctx.converge(&tasks).await.unwrap();
    assert_eq!(report.passes, 2);

    let written = root.path().join("etc/app/config.yaml");
    assert_eq!(std::fs::read_to_string(&written).unwrap(), "debug: false\n");
    let before = std::fs::metadata(&written).unwrap().modified().unwrap();

    // A second run against the converged node leaves the file alone.
    let direct = DirectTarget::new(root.path());
    let mut ctx = ConvergenceContext::new(Box::new(direct), true, fast_options(3));
    ctx.run_tasks(&tasks).await.unwrap();
    assert_eq!(std::fs::read_to_string(&written).unwrap(), "debug: false\n");
    assert_eq!(
        std::fs::metadata(&written).unwrap().modified().unwrap(),
        before
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_direct_applies_file_mode() {
    use std::os::unix::fs::PermissionsExt;

    let root = TempDir::new().unwrap();
    let tasks = task_map(vec![Arc::new(
        FileTask::new("secret", "/etc/secret", "s3cret").mode(0o600),
    )]);

    let ctx = ConvergenceContext::new(
        Box::new(DirectTarget::new(root.path())),
        true,
        fast_options(3),
    );
    ctx.converge(&tasks).await.unwrap();

    let meta = std::fs::metadata(root.path().join("etc/secret")).unwrap();
    assert_eq!(meta.permissions().mode() & 0o7777, 0o600);
}

#[cfg(unix)]
#[tokio::test]
async fn test_direct_repairs_drifted_modes() {
    use std::os::unix::fs::PermissionsExt;

    let root = TempDir::new().unwrap();
    let tasks = node_tasks();
    let first = ConvergenceContext::new(
        Box::new(DirectTarget::new(root.path())),
        true,
        fast_options(3),
    );
    first.converge(&tasks).await.unwrap();

    let dir = root.path().join("etc/app");
    let file = dir.join("config.yaml");
    std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).unwrap();
    std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o666)).unwrap();

    // the plan sees the drift before anything is repaired
    let out = SharedBuffer::new();
    let dry = ConvergenceContext::new(
        Box::new(DryRunTarget::new(root.path(), out.clone())),
        true,
        fast_options(3),
    );
    dry.converge(&tasks).await.unwrap();
    let plan = out.contents();
    assert!(plan.contains("change mode of /etc/app from 0700 to 0755"));
    assert!(plan.contains("update file /etc/app/config.yaml"));

    let second = ConvergenceContext::new(
        Box::new(DirectTarget::new(root.path())),
        true,
        fast_options(3),
    );
    second.converge(&tasks).await.unwrap();

    let mode = |p: &std::path::Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o7777;
    assert_eq!(mode(&dir), 0o755);
    assert_eq!(mode(&file), 0o644);
}

#[tokio::test]
async fn test_dry_run_reports_without_side_effects() {
    let root = TempDir::new().unwrap();
    let out = SharedBuffer::new();
    let tasks = node_tasks();

    let ctx = ConvergenceContext::new(
        Box::new(DryRunTarget::new(root.path(), out.clone())),
        true,
        fast_options(3),
    );
    ctx.converge(&tasks).await.unwrap();

    let report = out.contents();
    assert!(report.starts_with("Will make 2 change(s):\n"));
    assert!(report.contains("create directory /etc/app"));
    assert!(report.contains("create file /etc/app/config.yaml (13 bytes, mode 0644)"));
    assert!(!root.path().join("etc").exists());
}

#[tokio::test]
async fn test_dry_run_after_direct_reports_no_changes() {
    let root = TempDir::new().unwrap();
    let tasks = node_tasks();

    let direct = ConvergenceContext::new(
        Box::new(DirectTarget::new(root.path())),
        true,
        fast_options(3),
    );
    direct.converge(&tasks).await.unwrap();

    let out = SharedBuffer::new();
    let dry = ConvergenceContext::new(
        Box::new(DryRunTarget::new(root.path(), out.clone())),
        true,
        fast_options(3),
    );
    dry.converge(&tasks).await.unwrap();

    assert_eq!(out.contents(), "No changes.\n");
}

#[tokio::test]
async fn test_dry_run_does_not_run_commands() {
    let root = TempDir::new().unwrap();
    let marker = root.path().join("ran");
    let out = SharedBuffer::new();
    let tasks = task_map(vec![Arc::new(
        CommandTask::builder("touch")
            .name("touch-marker")
            .arg(marker.display().to_string())
            .build(),
    )]);

    let ctx = ConvergenceContext::new(
        Box::new(DryRunTarget::new(root.path(), out.clone())),
        true,
        fast_options(3),
    );
    ctx.converge(&tasks).await.unwrap();

    assert!(!marker.exists());
    assert!(out.contents().contains("run touch"));
}

#[tokio::test]
async fn test_cloud_config_script_lists_files_then_commands() {
    let out = SharedBuffer::new();
    let tasks = task_map(vec![
        Arc::new(FileTask::new("unit", "/etc/systemd/system/app.service", "[Unit]\n")),
        Arc::new(
            CommandTask::builder("systemctl")
                .name("start")
                .args(["enable", "--now", "app"])
                .depends_on(TaskRef::to("unit"))
                .build(),
        ) as Arc<dyn Task>,
    ]);

    let ctx = ConvergenceContext::new(
        Box::new(ScriptTarget::new(ScriptFormat::CloudConfig, out.clone())),
        false,
        fast_options(3),
    );
    ctx.converge(&tasks).await.unwrap();

    let rendered = out.contents();
    assert!(rendered.starts_with("#cloud-config\n"));
    let doc: serde_yaml::Value =
        serde_yaml::from_str(rendered.trim_start_matches("#cloud-config\n")).unwrap();
    assert_eq!(
        doc["write_files"][0]["path"].as_str(),
        Some("/etc/systemd/system/app.service")
    );
    assert_eq!(doc["runcmd"][0].as_str(), Some("systemctl enable --now app"));
}

#[tokio::test]
async fn test_shell_script_is_not_written_when_the_run_fails() {
    let out = SharedBuffer::new();
    let tasks = task_map(vec![
        Arc::new(DirectoryTask::new("a", "/a")),
        Arc::new(DirectoryTask::new("b", "/b").depends_on(TaskRef::to("missing"))),
    ]);

    let ctx = ConvergenceContext::new(
        Box::new(ScriptTarget::new(ScriptFormat::Shell, out.clone())),
        false,
        fast_options(3),
    );

    assert!(ctx.converge(&tasks).await.unwrap_err().is_config());
    assert!(out.contents().is_empty());
}
