use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use itemflow_core::behavior::WorkspaceBehavior;
use itemflow_core::config::ItemflowConfig;
use itemflow_core::done::{run_done, DoneOptions, DoneOutcome};
use itemflow_core::item::ItemDocument;
use itemflow_core::pr::{
    CheckState, CombinedStatus, MergeOutcome, MergeRequest, PrError, PullRequest,
    PullRequestProvider, RepoSlug, ReviewComment,
};
use itemflow_core::runner::ProcessRunner;
use itemflow_core::start::{run_start, StartOptions};
use pretty_assertions::assert_eq;
use serial_test::serial;
use tempfile::TempDir;

fn run_git(repo: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(args)
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn init_repo(path: &Path) {
    fs::create_dir_all(path).expect("repo dir");
    run_git(path, &["init"]);
    run_git(path, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    run_git(path, &["config", "user.name", "Itemflow Test"]);
    run_git(path, &["config", "user.email", "itemflow-test@example.com"]);
}

fn commit_all(path: &Path, message: &str) {
    run_git(path, &["add", "."]);
    run_git(path, &["commit", "-m", message]);
}

/// `<tmp>/app` holding item 014, plus a sibling `<tmp>/api` repository.
struct Workspace {
    tmp: TempDir,
    _home: TempDir,
}

impl Workspace {
    fn new(config: &str) -> Self {
        let tmp = TempDir::new().expect("tmp");
        let home = TempDir::new().expect("home");
        std::env::set_var("ITEMFLOW_HOME", home.path());

        let app = tmp.path().join("app");
        init_repo(&app);
        fs::create_dir_all(app.join("work/todo")).expect("todo");
        fs::write(
            app.join("work/todo/014-add-login-page.md"),
            "---\nid: '014'\ntitle: Add login page\nstatus: todo\nkind: feature\n---\n\nBody text.\n",
        )
        .expect("item");
        fs::write(app.join(".itemflow.toml"), config).expect("config");
        commit_all(&app, "seed");

        let api = tmp.path().join("api");
        init_repo(&api);
        fs::write(api.join("README.md"), "api\n").expect("readme");
        commit_all(&api, "seed");

        Self { tmp, _home: home }
    }

    fn app(&self) -> PathBuf {
        self.tmp.path().join("app")
    }

    fn api(&self) -> PathBuf {
        self.tmp.path().join("api")
    }

    fn worktree(&self) -> PathBuf {
        self.tmp.path().join("_worktrees/014-add-login-page")
    }
}

fn start_options() -> StartOptions {
    StartOptions {
        item: "14".to_string(),
        no_ide: true,
        ..StartOptions::default()
    }
}

fn read_item(path: &Path) -> ItemDocument {
    let text = fs::read_to_string(path).expect("read item");
    ItemDocument::parse(&text).expect("parse item")
}

fn local_branches(repo: &Path) -> String {
    run_git(repo, &["branch", "--list", "014-add-login-page"])
}

/// PR host stand-in holding one green pull request, open unless built with
/// [`OpenPullRequest::merged_as`].
struct OpenPullRequest {
    calls: RefCell<Vec<String>>,
    merge_commit: Option<String>,
}

impl OpenPullRequest {
    fn new() -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            merge_commit: None,
        }
    }

    fn merged_as(sha: String) -> Self {
        Self {
            merge_commit: Some(sha),
            ..Self::new()
        }
    }

    fn record(&self, call: String) {
        self.calls.borrow_mut().push(call);
    }
}

impl PullRequestProvider for OpenPullRequest {
    fn find_pull_request(
        &self,
        repo: &RepoSlug,
        branch: &str,
    ) -> Result<Option<PullRequest>, PrError> {
        self.record(format!("find:{repo}:{branch}"));
        Ok(Some(PullRequest {
            number: 42,
            title: "Add login page".to_string(),
            state: if self.merge_commit.is_some() { "closed" } else { "open" }.to_string(),
            head_ref: branch.to_string(),
            head_sha: Some("deadbeef".to_string()),
            mergeable: Some(true),
            merged_at: self
                .merge_commit
                .as_ref()
                .map(|_| "2026-03-04T05:06:07Z".to_string()),
            merge_commit_sha: self.merge_commit.clone(),
            html_url: None,
        }))
    }

    fn combined_status(&self, _repo: &RepoSlug, sha: &str) -> Result<CombinedStatus, PrError> {
        self.record(format!("status:{sha}"));
        Ok(CombinedStatus {
            state: CheckState::Success,
            statuses: Vec::new(),
        })
    }

    fn review_comments(
        &self,
        _repo: &RepoSlug,
        _number: u64,
    ) -> Result<Vec<ReviewComment>, PrError> {
        Ok(Vec::new())
    }

    fn merge(
        &self,
        _repo: &RepoSlug,
        number: u64,
        request: &MergeRequest,
    ) -> Result<MergeOutcome, PrError> {
        self.record(format!("merge:{number}:{}", request.commit_title));
        Ok(MergeOutcome {
            sha: Some("cafef00d".to_string()),
            merged: true,
            message: "Pull Request successfully merged".to_string(),
        })
    }

    fn delete_branch_ref(&self, _repo: &RepoSlug, branch: &str) -> Result<(), PrError> {
        self.record(format!("delete:{branch}"));
        Ok(())
    }
}

fn connect<'p>(
    provider: &'p OpenPullRequest,
) -> impl FnOnce(&ItemflowConfig, bool) -> Result<Box<dyn PullRequestProvider + 'p>, PrError> + 'p
{
    move |_, _| Ok(Box::new(provider))
}

#[test]
#[serial]
fn standalone_start_moves_item_on_the_feature_branch() {
    let workspace = Workspace::new("");
    let runner = ProcessRunner::new(false);

    let report = run_start(&runner, &workspace.app(), start_options()).expect("start");
    assert_eq!(report.behavior, WorkspaceBehavior::Standalone);
    assert!(report.worktree_created);
    assert_eq!(
        fs::canonicalize(&report.worktree).expect("worktree"),
        fs::canonicalize(workspace.worktree()).expect("expected")
    );

    let moved = workspace.worktree().join("work/doing/014-add-login-page.md");
    let item = read_item(&moved);
    assert_eq!(item.get_string("status").as_deref(), Some("doing"));
    assert!(item.body.contains("Body text."));
    assert_eq!(
        run_git(&workspace.worktree(), &["status", "--porcelain"]),
        ""
    );
    assert!(workspace.app().join("work/todo/014-add-login-page.md").is_file());
}

#[test]
#[serial]
fn start_with_reuse_branch_keeps_existing_worktree() {
    let workspace = Workspace::new("[workflow]\nstatus_action = \"none\"\n");
    let runner = ProcessRunner::new(false);
    run_start(&runner, &workspace.app(), start_options()).expect("first start");
    let marker = workspace.worktree().join("scratch.txt");
    fs::write(&marker, "keep me").expect("marker");

    let again = run_start(
        &runner,
        &workspace.app(),
        StartOptions {
            reuse_branch: true,
            ..start_options()
        },
    )
    .expect("reuse");
    assert!(!again.worktree_created);
    assert!(marker.is_file());
}

#[test]
#[serial]
fn start_with_override_recreates_worktree() {
    let workspace = Workspace::new("[workflow]\nstatus_action = \"none\"\n");
    let runner = ProcessRunner::new(false);
    run_start(&runner, &workspace.app(), start_options()).expect("first start");
    let marker = workspace.worktree().join("scratch.txt");
    fs::write(&marker, "discard me").expect("marker");

    let again = run_start(
        &runner,
        &workspace.app(),
        StartOptions {
            override_worktree: true,
            ..start_options()
        },
    )
    .expect("override");
    assert!(again.worktree_created);
    assert!(!marker.exists());
    assert!(workspace.worktree().join(".git").is_file());
}

#[test]
#[serial]
fn polyrepo_start_then_done_round_trip() {
    let workspace = Workspace::new(
        "[workflow]\nstatus_action = \"none\"\n\n\
         [github]\nowner = \"acme\"\nrepo = \"widgets\"\n\n\
         [[workspace.projects]]\nname = \"api\"\npath = \"../api\"\n",
    );
    let runner = ProcessRunner::new(false);

    let started = run_start(&runner, &workspace.app(), start_options()).expect("start");
    assert_eq!(started.behavior, WorkspaceBehavior::Polyrepo);
    assert_eq!(started.projects.len(), 1);
    let api_checkout = workspace.worktree().join("api");
    assert!(api_checkout.join("README.md").is_file());
    assert_eq!(
        run_git(&api_checkout, &["rev-parse", "--abbrev-ref", "HEAD"]),
        "014-add-login-page"
    );

    let provider = OpenPullRequest::new();
    let done = run_done(
        &runner,
        &workspace.app(),
        DoneOptions {
            item: "14".to_string(),
            ..DoneOptions::default()
        },
        connect(&provider),
    )
    .expect("done");

    assert_eq!(done.outcome, DoneOutcome::Merged);
    let calls = provider.calls.borrow().clone();
    assert!(calls.contains(&"merge:42:014: Add login page".to_string()), "{calls:?}");
    assert!(calls.contains(&"delete:014-add-login-page".to_string()));
    assert_eq!(done.cleanup.remote_branch_deleted, Some(true));
    assert_eq!(done.cleanup.local_branch_deleted, Some(true));

    assert!(!workspace.worktree().exists());
    assert_eq!(local_branches(&workspace.app()), "");
    assert_eq!(local_branches(&workspace.api()), "");

    let archived = workspace.app().join("work/done/014-add-login-page.md");
    let item = read_item(&archived);
    assert_eq!(item.get_string("status").as_deref(), Some("done"));
    assert_eq!(item.get_string("merge_commit_sha").as_deref(), Some("cafef00d"));
    assert_eq!(item.get_string("merge_strategy").as_deref(), Some("squash"));
    assert!(item.get_string("merged_at").is_some());
    assert!(!workspace.app().join("work/todo/014-add-login-page.md").exists());
    // No remote is configured, so the trunk pull is reported, not fatal.
    assert!(done.warnings.iter().any(|w| w.contains("could not pull")));
}

const POLYREPO_CONFIG: &str =
    "[workflow]\nstatus_action = \"none\"\n\n[[workspace.projects]]\nname = \"api\"\npath = \"../api\"\n";

#[test]
#[serial]
fn polyrepo_start_again_with_reuse_branch_keeps_project_checkout() {
    let workspace = Workspace::new(POLYREPO_CONFIG);
    let runner = ProcessRunner::new(false);
    let first = run_start(&runner, &workspace.app(), start_options()).expect("first start");
    assert!(first.projects[0].created);
    let scratch = workspace.worktree().join("api/scratch.txt");
    fs::write(&scratch, "keep me").expect("scratch");

    let again = run_start(
        &runner,
        &workspace.app(),
        StartOptions {
            reuse_branch: true,
            ..start_options()
        },
    )
    .expect("reuse");
    assert!(!again.worktree_created);
    assert_eq!(again.projects.len(), 1);
    assert!(!again.projects[0].created);
    assert!(scratch.is_file());
}

#[test]
#[serial]
fn polyrepo_start_with_override_recreates_project_checkout() {
    let workspace = Workspace::new(POLYREPO_CONFIG);
    let runner = ProcessRunner::new(false);
    run_start(&runner, &workspace.app(), start_options()).expect("first start");
    let scratch = workspace.worktree().join("api/scratch.txt");
    fs::write(&scratch, "discard me").expect("scratch");

    let again = run_start(
        &runner,
        &workspace.app(),
        StartOptions {
            override_worktree: true,
            ..start_options()
        },
    )
    .expect("override");
    assert!(again.worktree_created);
    assert!(again.projects[0].created);
    assert!(!scratch.exists());
    let api_checkout = workspace.worktree().join("api");
    assert!(api_checkout.join("README.md").is_file());
    assert_eq!(
        run_git(&api_checkout, &["rev-parse", "--abbrev-ref", "HEAD"]),
        "014-add-login-page"
    );
}

#[test]
#[serial]
fn done_after_remote_merge_leaves_item_only_in_done() {
    let workspace = Workspace::new("[github]\nowner = \"acme\"\nrepo = \"widgets\"\n");
    let origin = workspace.tmp.path().join("origin.git");
    fs::create_dir_all(&origin).expect("origin dir");
    run_git(&origin, &["init", "--bare"]);
    let origin_url = origin.to_string_lossy().to_string();
    run_git(&workspace.app(), &["remote", "add", "origin", &origin_url]);
    run_git(&workspace.app(), &["push", "origin", "main"]);

    let runner = ProcessRunner::new(false);
    run_start(&runner, &workspace.app(), start_options()).expect("start");
    run_git(&workspace.worktree(), &["push", "origin", "014-add-login-page"]);

    // Squash-merge the branch on the "host" side.
    let host = workspace.tmp.path().join("host");
    run_git(
        workspace.tmp.path(),
        &["clone", "--branch", "main", &origin_url, "host"],
    );
    run_git(&host, &["config", "user.name", "Itemflow Test"]);
    run_git(&host, &["config", "user.email", "itemflow-test@example.com"]);
    run_git(&host, &["merge", "--squash", "origin/014-add-login-page"]);
    run_git(&host, &["commit", "-m", "014: Add login page"]);
    run_git(&host, &["push", "origin", "main"]);
    let merge_sha = run_git(&host, &["rev-parse", "HEAD"]);

    let provider = OpenPullRequest::merged_as(merge_sha.clone());
    let done = run_done(
        &runner,
        &workspace.app(),
        DoneOptions {
            item: "14".to_string(),
            ..DoneOptions::default()
        },
        connect(&provider),
    )
    .expect("done");
    assert_eq!(done.outcome, DoneOutcome::AlreadyMerged);
    assert!(
        !done.warnings.iter().any(|w| w.contains("pull") || w.contains("re-read")),
        "{:?}",
        done.warnings
    );

    let work = workspace.app().join("work");
    let archived = work.join("done/014-add-login-page.md");
    assert_eq!(
        fs::canonicalize(&done.item_path).expect("item path"),
        fs::canonicalize(&archived).expect("archived")
    );
    assert!(!work.join("todo/014-add-login-page.md").exists());
    assert!(!work.join("doing/014-add-login-page.md").exists());
    let item = read_item(&archived);
    assert_eq!(item.get_string("status").as_deref(), Some("done"));
    assert_eq!(item.get_string("merge_commit_sha"), Some(merge_sha));
    let recorded = fs::read_to_string(&archived).expect("archived");

    let again = run_done(
        &runner,
        &workspace.app(),
        DoneOptions {
            item: "14".to_string(),
            ..DoneOptions::default()
        },
        connect(&provider),
    )
    .expect("second done");
    assert_eq!(again.outcome, DoneOutcome::AlreadyComplete);
    assert_eq!(fs::read_to_string(&archived).expect("archived"), recorded);
}
