//! Per-run workspace layout and artifact detection.
//!
//! Every run owns a `run_<id>/` directory with `input/` (task materials,
//! read-only as far as workers are concerned) and `output/` (the working
//! directory for every command a worker runs). Step documents, the
//! deliverable and the audit all land here; new files anywhere else under
//! `output/` count as worker-produced artifacts.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::catalog::TaskBrief;

pub const INPUT_DIR: &str = "input";
pub const OUTPUT_DIR: &str = "output";
pub const DELIVERABLE_FILE: &str = "deliverable.md";
pub const AUDIT_FILE: &str = "run_audit.json";
pub const STATUS_FILE: &str = "run_status.json";
pub const TASK_BRIEF_FILE: &str = "task_brief.md";

/// Directory layout for one run.
#[derive(Debug, Clone)]
pub struct RunWorkspace {
    run_id: String,
    root: PathBuf,
    input_dir: PathBuf,
    output_dir: PathBuf,
}

impl RunWorkspace {
    /// Create `runs_dir/run_<id>/{input,output}`.
    pub fn create(runs_dir: &Path, run_id: &str) -> io::Result<Self> {
        let root = runs_dir.join(format!("run_{}", run_id));
        let input_dir = root.join(INPUT_DIR);
        let output_dir = root.join(OUTPUT_DIR);
        fs::create_dir_all(&input_dir)?;
        fs::create_dir_all(&output_dir)?;
        Ok(Self {
            run_id: run_id.to_string(),
            root,
            input_dir,
            output_dir,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    /// Working directory for every worker-issued command.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn audit_path(&self) -> PathBuf {
        self.root.join(AUDIT_FILE)
    }

    pub fn status_path(&self) -> PathBuf {
        self.root.join(STATUS_FILE)
    }

    /// Environment injected into every command so scripts can locate the
    /// run directories without guessing.
    pub fn command_env(&self, task_id: &str) -> Vec<(String, String)> {
        vec![
            ("TASK_ID".to_string(), task_id.to_string()),
            (
                "TASK_ARTIFACT_DIR".to_string(),
                self.root.to_string_lossy().to_string(),
            ),
            (
                "TASK_INPUT_DIR".to_string(),
                self.input_dir.to_string_lossy().to_string(),
            ),
            (
                "TASK_OUTPUT_DIR".to_string(),
                self.output_dir.to_string_lossy().to_string(),
            ),
        ]
    }

    /// Render the task brief into `input/` for workers to read.
    pub fn write_task_brief(&self, task: &TaskBrief) -> io::Result<PathBuf> {
        let mut body = format!("# {}\n\n{}\n", task.title, task.brief.trim());
        if !task.delivery.trim().is_empty() {
            body.push_str(&format!(
                "\n## Delivery requirements\n\n{}\n",
                task.delivery.trim()
            ));
        }
        let path = self.input_dir.join(TASK_BRIEF_FILE);
        fs::write(&path, body)?;
        Ok(path)
    }

    /// Write the per-stage working document: `step_NN_<stage>.md`.
    pub fn write_step_document(
        &self,
        index: usize,
        stage: &str,
        body: &str,
    ) -> io::Result<PathBuf> {
        let name = format!("step_{:02}_{}.md", index, stage_slug(stage));
        let path = self.output_dir.join(&name);
        fs::write(&path, body)?;
        Ok(path)
    }

    /// Write the final deliverable. Called exactly once, at termination.
    pub fn write_deliverable(&self, body: &str) -> io::Result<PathBuf> {
        let path = self.output_dir.join(DELIVERABLE_FILE);
        fs::write(&path, body)?;
        Ok(path)
    }

    /// Relative paths of every visible file currently under `output/`.
    pub fn snapshot(&self) -> BTreeSet<String> {
        let mut files = Vec::new();
        collect_files(&self.output_dir, &self.output_dir, &mut files);
        files.into_iter().collect()
    }

    /// Files that appeared since `baseline`, excluding engine-written ones.
    pub fn new_files_since(&self, baseline: &BTreeSet<String>) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter(|f| !baseline.contains(f) && !is_system_file(f))
            .collect()
    }
}

/// Files the engine itself writes do not count as worker artifacts.
pub fn is_system_file(rel: &str) -> bool {
    let path = Path::new(rel);
    if path
        .components()
        .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
    {
        return true;
    }
    let name = match path.file_name() {
        Some(n) => n.to_string_lossy(),
        None => return true,
    };
    if path.components().count() == 1 {
        if name == DELIVERABLE_FILE || name == AUDIT_FILE || name == STATUS_FILE {
            return true;
        }
        if name.starts_with("step_") && name.ends_with(".md") {
            return true;
        }
    }
    false
}

/// Lowercase filename-safe form of a stage name. Unicode letters survive,
/// everything else becomes an underscore.
fn stage_slug(name: &str) -> String {
    let slug: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    slug.trim_matches('_').to_string()
}

fn collect_files(dir: &Path, base: &Path, files: &mut Vec<String>) {
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            let hidden = path
                .file_name()
                .map(|n| n.to_string_lossy().starts_with('.'))
                .unwrap_or(false);
            if hidden {
                continue;
            }
            if path.is_file() {
                if let Ok(rel) = path.strip_prefix(base) {
                    files.push(rel.to_string_lossy().to_string());
                }
            } else if path.is_dir() {
                collect_files(&path, base, files);
            }
        }
    }
}
