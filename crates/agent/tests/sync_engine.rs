//! Sync engine integration tests over real temp directories.

use agent::plan::{build_plan, build_vars};
use agent::sync::{self, ResolvedMapping, SyncPlan, STAGING_DIR_NAME};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use stoker_api::crd::{DesignerSessionPolicy, MappingSpec, PatchSpec};
use stoker_api::ResolvedProfile;
use tempfile::TempDir;

struct Fixture {
    _repo: TempDir,
    _live: TempDir,
    repo_path: PathBuf,
    live_path: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let repo = TempDir::new().expect("repo tempdir");
        let live = TempDir::new().expect("live tempdir");
        let repo_path = repo.path().to_path_buf();
        let live_path = live.path().to_path_buf();
        Self {
            _repo: repo,
            _live: live,
            repo_path,
            live_path,
        }
    }

    fn write_repo(&self, rel: &str, content: &str) {
        let path = self.repo_path.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, content).expect("write");
    }

    fn write_live(&self, rel: &str, content: &str) {
        let path = self.live_path.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, content).expect("write");
    }

    fn live_file(&self, rel: &str) -> Option<String> {
        fs::read_to_string(self.live_path.join(rel)).ok()
    }

    fn plan(&self, mappings: Vec<ResolvedMapping>, excludes: Vec<String>) -> SyncPlan {
        SyncPlan {
            mappings,
            exclude_patterns: excludes,
            staging_dir: self.live_path.join(STAGING_DIR_NAME),
            live_dir: self.live_path.clone(),
            dry_run: false,
            apply_template: None,
        }
    }

    fn dir_mapping(&self, source: &str, destination: &str) -> ResolvedMapping {
        ResolvedMapping {
            source: self.repo_path.join(source),
            destination: destination.to_string(),
            type_hint: None,
            required: true,
            template: false,
            apply_patches: None,
        }
    }
}

#[test]
fn first_sync_copies_everything_second_sync_is_a_noop() {
    let fx = Fixture::new();
    fx.write_repo("projects/alpha/view.json", "{\"v\":1}");
    fx.write_repo("projects/beta/view.json", "{\"v\":2}");

    let plan = fx.plan(vec![fx.dir_mapping("projects", "projects")], vec![]);
    let first = sync::execute(&plan).expect("first run");
    assert_eq!(first.files_added, 2);
    assert_eq!(first.files_modified, 0);
    assert_eq!(first.files_deleted, 0);
    assert_eq!(first.projects_synced, vec!["alpha", "beta"]);
    assert_eq!(fx.live_file("projects/alpha/view.json").as_deref(), Some("{\"v\":1}"));

    let second = sync::execute(&plan).expect("second run");
    assert_eq!(second.files_changed(), 0, "second run must be a no-op");
}

#[test]
fn orphans_inside_managed_roots_are_deleted_siblings_survive() {
    let fx = Fixture::new();
    fx.write_repo("projects/alpha/view.json", "{}");
    fx.write_live("projects/stale.json", "{\"old\":true}");
    fx.write_live("unrelated/keepme", "precious");

    let plan = fx.plan(vec![fx.dir_mapping("projects", "projects")], vec![]);
    let result = sync::execute(&plan).expect("run");
    assert_eq!(result.files_deleted, 1);
    assert!(fx.live_file("projects/stale.json").is_none(), "orphan removed");
    assert_eq!(fx.live_file("unrelated/keepme").as_deref(), Some("precious"));

    // Any number of further syncs leaves the sibling untouched
    sync::execute(&plan).expect("again");
    assert_eq!(fx.live_file("unrelated/keepme").as_deref(), Some("precious"));
}

#[test]
fn excluded_files_are_never_copied_and_never_deleted() {
    let fx = Fixture::new();
    fx.write_repo("projects/alpha/view.json", "{}");
    fx.write_repo("projects/alpha/scratch.tmp", "temp");
    fx.write_live("projects/alpha/local.tmp", "gateway-local");

    let plan = fx.plan(
        vec![fx.dir_mapping("projects", "projects")],
        vec!["**/*.tmp".to_string()],
    );
    let result = sync::execute(&plan).expect("run");

    assert!(fx.live_file("projects/alpha/scratch.tmp").is_none(), "not copied");
    assert_eq!(
        fx.live_file("projects/alpha/local.tmp").as_deref(),
        Some("gateway-local"),
        "pre-existing excluded file survives merge"
    );
    assert_eq!(result.files_deleted, 0);
}

#[test]
fn dot_resources_is_always_excluded() {
    let fx = Fixture::new();
    fx.write_repo("projects/alpha/view.json", "{}");
    fx.write_repo("projects/alpha/.resources/icon.png", "binary-ish");
    fx.write_live("projects/alpha/.resources/cache.bin", "gateway-owned");

    let plan = fx.plan(vec![fx.dir_mapping("projects", "projects")], vec![]);
    sync::execute(&plan).expect("run");

    assert!(fx.live_file("projects/alpha/.resources/icon.png").is_none());
    assert_eq!(
        fx.live_file("projects/alpha/.resources/cache.bin").as_deref(),
        Some("gateway-owned")
    );
}

#[test]
fn later_mappings_overlay_earlier_ones() {
    let fx = Fixture::new();
    fx.write_repo("base/config/settings.json", "{\"tier\":\"base\"}");
    fx.write_repo("override/config/settings.json", "{\"tier\":\"site\"}");

    let plan = fx.plan(
        vec![
            fx.dir_mapping("base", "ignition"),
            fx.dir_mapping("override", "ignition"),
        ],
        vec![],
    );
    sync::execute(&plan).expect("run");
    assert_eq!(
        fx.live_file("ignition/config/settings.json").as_deref(),
        Some("{\"tier\":\"site\"}")
    );
}

#[test]
fn dry_run_reports_the_diff_without_writing() {
    let fx = Fixture::new();
    fx.write_repo("projects/alpha/view.json", "{}");
    fx.write_live("projects/orphan.json", "{}");
    fx.write_live("projects/alpha/view.json", "stale-content");

    let mut plan = fx.plan(vec![fx.dir_mapping("projects", "projects")], vec![]);
    plan.dry_run = true;

    let result = sync::execute(&plan).expect("dry run");
    let diff = result.dry_run_diff.expect("diff present");
    assert_eq!(diff.modified, vec!["projects/alpha/view.json"]);
    assert_eq!(diff.deleted, vec!["projects/orphan.json"]);
    assert!(diff.added.is_empty());

    // Nothing on disk moved
    assert_eq!(fx.live_file("projects/alpha/view.json").as_deref(), Some("stale-content"));
    assert!(fx.live_file("projects/orphan.json").is_some());

    // A real run then produces exactly that diff
    plan.dry_run = false;
    let applied = sync::execute(&plan).expect("real run");
    assert_eq!(applied.files_modified, 1);
    assert_eq!(applied.files_deleted, 1);
    assert_eq!(fx.live_file("projects/alpha/view.json").as_deref(), Some("{}"));
}

#[test]
fn required_source_missing_fails_the_plan() {
    let fx = Fixture::new();
    let plan = fx.plan(vec![fx.dir_mapping("absent", "configs")], vec![]);
    let err = sync::execute(&plan).expect_err("must fail");
    assert!(matches!(err, sync::SyncError::RequiredSourceMissing { .. }));
}

#[test]
fn optional_source_missing_skips_without_touching_live() {
    let fx = Fixture::new();
    fx.write_live("configs/existing.json", "{}");
    let mut mapping = fx.dir_mapping("absent", "configs");
    mapping.required = false;
    let plan = fx.plan(vec![mapping], vec![]);
    let result = sync::execute(&plan).expect("run");
    assert_eq!(result.files_changed(), 0);
    assert!(fx.live_file("configs/existing.json").is_some());
}

#[test]
fn binary_file_under_template_fails_before_merge() {
    let fx = Fixture::new();
    fx.write_repo("configs/ok.json", "{\"a\":1}");
    let binary = fx.repo_path.join("configs/blob.bin");
    fs::write(&binary, b"head\0tail").expect("write binary");
    fx.write_live("configs/precious.json", "keep");

    let profile = ResolvedProfile {
        mappings: vec![MappingSpec {
            source: "configs".to_string(),
            destination: "configs".to_string(),
            r#type: None,
            required: true,
            template: true,
            patches: Vec::new(),
        }],
        exclude_patterns: vec![],
        vars: BTreeMap::new(),
        sync_period: 300,
        designer_session_policy: DesignerSessionPolicy::Proceed,
        dry_run: false,
        paused: false,
    };
    let vars = build_vars(
        &profile.vars,
        "edge-01",
        "edge-01-0",
        "ignition",
        "plant",
        "default",
        "0123456789abcdef0123456789abcdef01234567",
        "main",
    );
    let plan = build_plan(&profile, &vars, &fx.repo_path, &fx.live_path).expect("plan");

    let err = sync::execute(&plan).expect_err("binary input must fail");
    assert!(matches!(err, sync::SyncError::BinaryTemplateInput { .. }));
    // The live tree was never touched
    assert_eq!(fx.live_file("configs/precious.json").as_deref(), Some("keep"));
    assert!(fx.live_file("configs/ok.json").is_none());
}

#[test]
fn template_and_patch_combine_and_stay_idempotent() {
    let fx = Fixture::new();
    fx.write_repo(
        "gateway-config/system-properties/config.json",
        "{\n  \"SystemName\": \"placeholder\",\n  \"Greeting\": \"hello {{GatewayName}}\"\n}",
    );

    let profile = ResolvedProfile {
        mappings: vec![MappingSpec {
            source: "gateway-config".to_string(),
            destination: "config".to_string(),
            r#type: None,
            required: true,
            template: true,
            patches: vec![PatchSpec {
                file: Some("system-properties/config.json".to_string()),
                set: BTreeMap::from([(
                    "SystemName".to_string(),
                    "{{GatewayName}}".to_string(),
                )]),
            }],
        }],
        exclude_patterns: vec![],
        vars: BTreeMap::new(),
        sync_period: 300,
        designer_session_policy: DesignerSessionPolicy::Proceed,
        dry_run: false,
        paused: false,
    };
    let vars = build_vars(
        &profile.vars,
        "edge-01",
        "edge-01-0",
        "ignition",
        "plant",
        "default",
        "0123456789abcdef0123456789abcdef01234567",
        "main",
    );
    let plan = build_plan(&profile, &vars, &fx.repo_path, &fx.live_path).expect("plan");

    sync::execute(&plan).expect("first run");
    let content = fx
        .live_file("config/system-properties/config.json")
        .expect("file synced");
    let parsed: serde_json::Value = serde_json::from_str(&content).expect("valid json");
    assert_eq!(parsed["SystemName"], "edge-01");
    assert_eq!(parsed["Greeting"], "hello edge-01");

    // Unchanged source: second sync reports zero diffs
    let second = sync::execute(&plan).expect("second run");
    assert_eq!(second.files_changed(), 0);
}

#[test]
fn file_mapping_stages_a_single_file() {
    let fx = Fixture::new();
    fx.write_repo("seed/redundancy.json", "{\"mode\":\"independent\"}");

    let mapping = ResolvedMapping {
        source: fx.repo_path.join("seed/redundancy.json"),
        destination: "data/redundancy.json".to_string(),
        type_hint: Some(sync::MappingKind::File),
        required: true,
        template: false,
        apply_patches: None,
    };
    let plan = fx.plan(vec![mapping], vec![]);
    let result = sync::execute(&plan).expect("run");
    assert_eq!(result.files_added, 1);
    assert_eq!(
        fx.live_file("data/redundancy.json").as_deref(),
        Some("{\"mode\":\"independent\"}")
    );
}

#[test]
fn type_hint_mismatch_is_an_error() {
    let fx = Fixture::new();
    fx.write_repo("configs/settings.json", "{}");

    let mapping = ResolvedMapping {
        source: fx.repo_path.join("configs"),
        destination: "configs".to_string(),
        type_hint: Some(sync::MappingKind::File),
        required: true,
        template: false,
        apply_patches: None,
    };
    let plan = fx.plan(vec![mapping], vec![]);
    let err = sync::execute(&plan).expect_err("must fail");
    assert!(matches!(err, sync::SyncError::TypeHintMismatch { .. }));
}

#[test]
fn no_write_escapes_the_live_and_staging_dirs() {
    // One shared root with repo, live, and a bystander directory next to
    // each other; the bystander must be untouched by any run
    let root = TempDir::new().expect("root tempdir");
    let repo = root.path().join("repo");
    let live = root.path().join("live");
    let bystander = root.path().join("bystander");
    fs::create_dir_all(repo.join("projects/alpha")).expect("mkdir");
    fs::create_dir_all(&live).expect("mkdir");
    fs::create_dir_all(&bystander).expect("mkdir");
    fs::write(repo.join("projects/alpha/view.json"), "{}").expect("write");
    fs::write(bystander.join("keep.txt"), "untouchable").expect("write");

    let plan = SyncPlan {
        mappings: vec![ResolvedMapping {
            source: repo.join("projects"),
            destination: "projects".to_string(),
            type_hint: None,
            required: true,
            template: false,
            apply_patches: None,
        }],
        exclude_patterns: vec![],
        staging_dir: live.join(STAGING_DIR_NAME),
        live_dir: live.clone(),
        dry_run: false,
        apply_template: None,
    };
    let before = list_tree(&bystander);
    sync::execute(&plan).expect("run");
    let after = list_tree(&bystander);
    assert_eq!(before, after, "paths outside the plan must not change");
    assert_eq!(
        fs::read_to_string(bystander.join("keep.txt")).expect("read"),
        "untouchable"
    );
}

fn list_tree(root: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(read) = fs::read_dir(root) {
        for entry in read.flatten() {
            paths.push(entry.path());
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                paths.extend(list_tree(&entry.path()));
            }
        }
    }
    paths.sort();
    paths
}
