//! Canonical `.loopsmith/` layout and project scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;

use crate::core::task::TaskList;
use crate::io::backlog::Backlog;
use crate::io::config::{LoopConfig, write_config};
use crate::io::state_store::{RunState, StateStore};

/// All canonical paths within `.loopsmith/` for a project root.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub loop_dir: PathBuf,
    pub state_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub prd_path: PathBuf,
    pub run_state_path: PathBuf,
    pub config_path: PathBuf,
    pub tasks_path: PathBuf,
    pub backlog_path: PathBuf,
    pub lock_path: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let loop_dir = root.join(".loopsmith");
        let state_dir = loop_dir.join("state");
        Self {
            root: root.clone(),
            loop_dir: loop_dir.clone(),
            state_dir: state_dir.clone(),
            runs_dir: loop_dir.join("runs"),
            gitignore_path: loop_dir.join(".gitignore"),
            prd_path: loop_dir.join("PRD.md"),
            run_state_path: state_dir.join("run_state.json"),
            config_path: state_dir.join("config.toml"),
            tasks_path: state_dir.join("tasks.json"),
            backlog_path: state_dir.join("backlog.json"),
            lock_path: state_dir.join("run.lock"),
        }
    }

    /// Render `path` relative to the project root for prompts and evidence.
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

/// Options for [`init_project`].
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing loop-owned files.
    pub force: bool,
}

/// Create `.loopsmith/` scaffolding in `root`.
///
/// Fails if `.loopsmith/` already exists unless `options.force` is set.
pub fn init_project(root: &Path, options: &InitOptions) -> Result<ProjectPaths> {
    let paths = ProjectPaths::new(root);
    if paths.loop_dir.exists() && !options.force {
        return Err(anyhow!(
            "loopsmith init: .loopsmith already exists (use --force to overwrite)"
        ));
    }
    if paths.loop_dir.exists() && !paths.loop_dir.is_dir() {
        return Err(anyhow!(
            "loopsmith init: .loopsmith exists but is not a directory"
        ));
    }

    create_dir(&paths.loop_dir)?;
    create_dir(&paths.state_dir)?;
    create_dir(&paths.runs_dir)?;

    write_file(&paths.gitignore_path, LOOP_GITIGNORE)?;
    write_file(&paths.prd_path, PRD_PLACEHOLDER)?;
    write_config(&paths.config_path, &LoopConfig::default())?;
    write_json(&paths.tasks_path, &TaskList::default())?;
    write_json(&paths.backlog_path, &Backlog::default())?;
    StateStore::new(&paths).write(&RunState::default())?;

    Ok(paths)
}

/// True when the PRD exists and no longer carries the draft marker.
pub fn prd_is_complete(paths: &ProjectPaths) -> Result<bool> {
    if !paths.prd_path.exists() {
        return Ok(false);
    }
    let contents = fs::read_to_string(&paths.prd_path)
        .with_context(|| format!("read {}", paths.prd_path.display()))?;
    Ok(!contents.contains(PRD_DRAFT_MARKER) && !contents.trim().is_empty())
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_file(path, &buf)
}

/// Present in the PRD until the requirements interview is finished.
pub const PRD_DRAFT_MARKER: &str = "<!-- loopsmith:draft -->";

const PRD_PLACEHOLDER: &str = "<!-- loopsmith:draft -->\n# Product Requirements\n\n\
Describe the product, its users and the acceptance criteria here.\n\
Remove the draft marker above once the requirements are complete.\n";
const LOOP_GITIGNORE: &str = "runs/\nstate/run.lock\n";
