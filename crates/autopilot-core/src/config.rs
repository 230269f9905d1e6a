//! Configuration loading for the supervisor.
//!
//! The primary source is `<base>/config.yaml`. Projects can come from
//! three places, tried in order: a `projects:` list in the primary YAML, a
//! `project_dirs:` list (window names derived from directory basenames,
//! disambiguated by suffix on collision), or a line-delimited
//! `projects.conf` (`window:dir[:default_nudge]`, `#` comments). The
//! chosen source is logged once at startup. Configuration errors are fatal
//! at startup; there is no runtime reload.

use crate::patterns::PatternOverrides;
use crate::paths::sanitize_window;
use crate::rules::{RuleError, RuleSet, RuleSpec};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("projects.conf line {line}: expected window:dir[:default_nudge], got '{content}'")]
    BadConfLine { line: usize, content: String },

    #[error(transparent)]
    Rule(#[from] RuleError),
}

/// One supervised project: a tmux window plus a git working tree.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Project {
    pub window: String,
    pub dir: PathBuf,
    #[serde(default)]
    pub default_nudge: Option<String>,
}

/// Where the project list came from, for the startup log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectsSource {
    PrimaryYaml,
    ProjectDirs,
    ConfFile,
    BuiltIn,
}

impl ProjectsSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectsSource::PrimaryYaml => "config.yaml projects list",
            ProjectsSource::ProjectDirs => "config.yaml project_dirs list",
            ProjectsSource::ConfFile => "projects.conf",
            ProjectsSource::BuiltIn => "built-in default",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TmuxConfig {
    #[serde(default = "default_tmux_bin")]
    pub bin: String,
    #[serde(default = "default_session")]
    pub session: String,
}

fn default_tmux_bin() -> String {
    "tmux".to_string()
}

fn default_session() -> String {
    "autopilot".to_string()
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            bin: default_tmux_bin(),
            session: default_session(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantConfig {
    /// Launch command injected by `resume-shell` (after `cd <dir> && `).
    #[serde(default = "default_assistant_cmd")]
    pub command: String,
}

fn default_assistant_cmd() -> String {
    "codex resume --last --full-auto".to_string()
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            command: default_assistant_cmd(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewConfig {
    /// Commits since last review that force a trigger.
    #[serde(default = "default_commit_threshold")]
    pub commit_threshold: u64,
    /// Seconds since last review after which any commits force a trigger.
    #[serde(default = "default_review_max_age")]
    pub max_age_secs: u64,
    /// Age past which a pending trigger is force-consumed even if the
    /// window never goes idle.
    #[serde(default = "default_trigger_stale")]
    pub stale_trigger_secs: u64,
    /// Cap on the changed-file preview embedded in the instruction.
    #[serde(default = "default_preview_cap")]
    pub file_preview_cap: usize,
}

fn default_commit_threshold() -> u64 {
    15
}

fn default_review_max_age() -> u64 {
    7200
}

fn default_trigger_stale() -> u64 {
    7200
}

fn default_preview_cap() -> usize {
    20
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            commit_threshold: default_commit_threshold(),
            max_age_secs: default_review_max_age(),
            stale_trigger_secs: default_trigger_stale(),
            file_preview_cap: default_preview_cap(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: i64,
}

/// Raw YAML shape of `config.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawConfig {
    base_dir: Option<PathBuf>,
    #[serde(default)]
    tmux: TmuxConfig,
    #[serde(default)]
    assistant: AssistantConfig,
    tick_secs: Option<u64>,
    low_context_threshold: Option<i64>,
    low_context_critical: Option<i64>,
    #[serde(default)]
    review: ReviewConfig,
    #[serde(default)]
    projects: Vec<Project>,
    #[serde(default)]
    project_dirs: Vec<PathBuf>,
    telegram: Option<TelegramConfig>,
    /// Path to the external PRD verification engine, if deployed.
    prd_engine: Option<String>,
    #[serde(default)]
    patterns: PatternOverrides,
    rules: Option<Vec<RuleSpec>>,
    #[serde(default)]
    templates: HashMap<String, String>,
}

/// Fully resolved supervisor configuration.
#[derive(Debug, Clone)]
pub struct AutopilotConfig {
    pub base_dir: PathBuf,
    pub tmux: TmuxConfig,
    pub assistant: AssistantConfig,
    pub tick_secs: u64,
    pub low_context_threshold: i64,
    /// Separate critical threshold, used only for an extra one-shot alert.
    pub low_context_critical: i64,
    pub review: ReviewConfig,
    pub projects: Vec<Project>,
    pub projects_source: ProjectsSource,
    pub telegram: Option<TelegramConfig>,
    pub prd_engine: Option<String>,
    pub patterns: PatternOverrides,
    pub rules: RuleSet,
    pub templates: HashMap<String, String>,
}

impl AutopilotConfig {
    /// Loads from `<base>/config.yaml`, tolerating a missing file (all
    /// defaults). Project fallback goes through `<base>/projects.conf`.
    pub fn load(base: &Path) -> Result<Self, ConfigError> {
        let yaml_path = base.join("config.yaml");
        let raw: RawConfig = if yaml_path.exists() {
            serde_yaml::from_str(&std::fs::read_to_string(&yaml_path)?)?
        } else {
            RawConfig::default()
        };
        Self::resolve(base, raw)
    }

    fn resolve(base: &Path, raw: RawConfig) -> Result<Self, ConfigError> {
        let base_dir = raw.base_dir.unwrap_or_else(|| base.to_path_buf());

        let (projects, projects_source) = if !raw.projects.is_empty() {
            (raw.projects, ProjectsSource::PrimaryYaml)
        } else if !raw.project_dirs.is_empty() {
            (
                projects_from_dirs(&raw.project_dirs),
                ProjectsSource::ProjectDirs,
            )
        } else {
            let conf = base_dir.join("projects.conf");
            if conf.exists() {
                (
                    parse_projects_conf(&std::fs::read_to_string(&conf)?)?,
                    ProjectsSource::ConfFile,
                )
            } else {
                (Vec::new(), ProjectsSource::BuiltIn)
            }
        };

        let rules = match &raw.rules {
            Some(specs) => RuleSet::from_specs(specs, &raw.templates)?,
            None => RuleSet::default(),
        };

        Ok(Self {
            base_dir,
            tmux: raw.tmux,
            assistant: raw.assistant,
            tick_secs: raw.tick_secs.unwrap_or(10),
            low_context_threshold: raw.low_context_threshold.unwrap_or(25),
            low_context_critical: raw.low_context_critical.unwrap_or(10),
            review: raw.review,
            projects,
            projects_source,
            telegram: raw.telegram,
            prd_engine: raw.prd_engine,
            patterns: raw.patterns,
            rules,
            templates: raw.templates,
        })
    }

    /// Template body for a name: configured override, then built-in.
    pub fn template(&self, name: &str) -> &str {
        if let Some(body) = self.templates.get(name) {
            return body;
        }
        match name {
            "recovery" => crate::nudge::DEFAULT_RECOVERY_TEMPLATE,
            _ => crate::nudge::DEFAULT_NUDGE_TEMPLATE,
        }
    }
}

/// Derives `{window, dir}` entries from bare directories. Basename
/// collisions get a numeric suffix so every window name stays unique.
fn projects_from_dirs(dirs: &[PathBuf]) -> Vec<Project> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    dirs.iter()
        .map(|dir| {
            let base = dir
                .file_name()
                .map(|n| sanitize_window(&n.to_string_lossy()))
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| "project".to_string());
            let n = seen.entry(base.clone()).or_insert(0);
            *n += 1;
            let window = if *n == 1 {
                base
            } else {
                format!("{base}-{n}")
            };
            Project {
                window,
                dir: dir.clone(),
                default_nudge: None,
            }
        })
        .collect()
}

/// Parses the line-delimited fallback format.
fn parse_projects_conf(content: &str) -> Result<Vec<Project>, ConfigError> {
    let mut projects = Vec::new();
    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(3, ':');
        let window = parts.next().unwrap_or_default().trim();
        let dir = parts.next().map(str::trim);
        let nudge = parts.next().map(str::trim);
        let Some(dir) = dir.filter(|d| !d.is_empty() && !window.is_empty()) else {
            return Err(ConfigError::BadConfLine {
                line: i + 1,
                content: line.to_string(),
            });
        };
        projects.push(Project {
            window: window.to_string(),
            dir: PathBuf::from(dir),
            default_nudge: nudge.filter(|n| !n.is_empty()).map(str::to_string),
        });
    }
    Ok(projects)
}

/// Formats the project list back into the conf format (round-trip aid for
/// operators and tests).
pub fn format_projects_conf(projects: &[Project]) -> String {
    let mut out = String::new();
    for p in projects {
        out.push_str(&p.window);
        out.push(':');
        out.push_str(&p.dir.to_string_lossy());
        if let Some(nudge) = &p.default_nudge {
            out.push(':');
            out.push_str(nudge);
        }
        out.push('\n');
    }
    out
}
