use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::{DEFAULT_OUTPUT_DIR, MirrorConfig, load_config};

pub const STATE_DIR_NAME: &str = ".wikimirror";
pub const CONFIG_FILENAME: &str = "config.toml";
pub const CREDENTIAL_FILENAME: &str = "url.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Config,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Config => "config",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub credential_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub output_root: PathBuf,
    pub credential_path: PathBuf,
    pub root_source: ValueSource,
    pub config_source: ValueSource,
    pub output_source: ValueSource,
    pub credential_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\nconfig_path={} ({})\noutput_root={} ({})\ncredential_path={} ({})",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.output_root),
            self.output_source.as_str(),
            normalize_for_display(&self.credential_path),
            self.credential_source.as_str(),
        )
    }

    /// Directory holding one mirror subdirectory per site.
    pub fn ensure_output_root(&self) -> Result<bool> {
        if self.output_root.is_dir() {
            return Ok(false);
        }
        fs::create_dir_all(&self.output_root)
            .with_context(|| format!("failed to create {}", self.output_root.display()))?;
        Ok(true)
    }
}

/// Resolved paths together with the config file they point at.
#[derive(Debug, Clone)]
pub struct Runtime {
    pub paths: ResolvedPaths,
    pub config: MirrorConfig,
}

pub fn resolve_runtime(context: &ResolutionContext, overrides: &PathOverrides) -> Result<Runtime> {
    resolve_runtime_with_lookup(context, overrides, |key| env::var(key).ok())
}

pub fn resolve_runtime_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<Runtime>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env);
    let state_dir = project_root.join(STATE_DIR_NAME);

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (
            absolutize(path, &project_root),
            ValueSource::Flag,
        )
    } else if let Some(value) = non_empty_env(&lookup_env, "WIKIMIRROR_CONFIG") {
        (
            absolutize(Path::new(&value), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join(CONFIG_FILENAME), ValueSource::Default)
    };
    let config = load_config(&config_path)?;

    let (output_root, output_source) = if let Some(path) = overrides.output_dir.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(value) = non_empty_env(&lookup_env, "WIKIMIRROR_OUTPUT_DIR") {
        (
            absolutize(Path::new(&value), &project_root),
            ValueSource::Env,
        )
    } else if let Some(value) = config.sync.output_dir.as_deref() {
        (
            absolutize(Path::new(value), &project_root),
            ValueSource::Config,
        )
    } else {
        (project_root.join(DEFAULT_OUTPUT_DIR), ValueSource::Default)
    };

    let (credential_path, credential_source) =
        if let Some(path) = overrides.credential_file.as_deref() {
            (absolutize(path, &context.cwd), ValueSource::Flag)
        } else if let Some(value) = non_empty_env(&lookup_env, "WIKIMIRROR_URL_FILE") {
            (
                absolutize(Path::new(&value), &project_root),
                ValueSource::Env,
            )
        } else {
            (project_root.join(CREDENTIAL_FILENAME), ValueSource::Default)
        };

    Ok(Runtime {
        paths: ResolvedPaths {
            project_root,
            state_dir,
            config_path,
            output_root,
            credential_path,
            root_source,
            config_source,
            output_source,
            credential_source,
        },
        config,
    })
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return (absolutize(path, &context.cwd), ValueSource::Flag);
    }
    if let Some(value) = non_empty_env(lookup_env, "WIKIMIRROR_PROJECT_ROOT") {
        return (absolutize(Path::new(&value), &context.cwd), ValueSource::Env);
    }
    match detect_project_root(&context.cwd) {
        Some(root) => (root, ValueSource::Heuristic),
        None => (context.cwd.clone(), ValueSource::Default),
    }
}

/// Nearest ancestor of `cwd` (inclusive) that carries a state directory.
fn detect_project_root(cwd: &Path) -> Option<PathBuf> {
    let mut seen = HashSet::new();
    cwd.ancestors()
        .filter(|candidate| seen.insert(normalize_for_display(candidate)))
        .find(|candidate| candidate.join(STATE_DIR_NAME).is_dir())
        .map(Path::to_path_buf)
}

fn non_empty_env<F>(lookup_env: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup_env(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
