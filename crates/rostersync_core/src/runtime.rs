use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::config::{RosterConfig, default_config_toml};

pub const STATE_DIR_NAME: &str = ".rostersync";
pub const CONFIG_FILENAME: &str = "config.toml";
pub const DB_FILENAME: &str = "roster.db";

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
    pub db: Option<PathBuf>,
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
    pub db_path: PathBuf,
    pub root_source: ValueSource,
    pub config_source: ValueSource,
    pub db_source: ValueSource,
}

impl ResolvedPaths {
    /// Let `[store] path` take effect when neither flag nor env set the db.
    pub fn apply_config(&mut self, config: &RosterConfig) {
        if self.db_source != ValueSource::Default {
            return;
        }
        if let Some(path) = config
            .store
            .path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
        {
            self.db_path = absolutize(Path::new(path), &self.project_root);
            self.db_source = ValueSource::Config;
        }
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\nconfig_path={} ({})\ndb_path={} ({})",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.db_path),
            self.db_source.as_str(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub state_dir_exists: bool,
    pub config_exists: bool,
    pub db_exists: bool,
    pub db_size_bytes: Option<u64>,
    pub warnings: Vec<String>,
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let state_dir_exists = paths.state_dir.exists();
    let config_exists = paths.config_path.exists();
    let db_exists = paths.db_path.exists();
    let db_size_bytes = if db_exists {
        let metadata = fs::metadata(&paths.db_path)
            .with_context(|| format!("failed to inspect {}", paths.db_path.display()))?;
        Some(metadata.len())
    } else {
        None
    };

    let mut warnings = Vec::new();
    if !state_dir_exists {
        warnings.push(format!(
            "{STATE_DIR_NAME}/ is missing; run `rostersync init` before reconciling"
        ));
    }
    if !config_exists {
        warnings.push("config file is missing; built-in defaults apply".to_string());
    }

    Ok(RuntimeStatus {
        state_dir_exists,
        config_exists,
        db_exists,
        db_size_bytes,
        warnings,
    })
}

pub fn ensure_runtime_ready(paths: &ResolvedPaths, status: &RuntimeStatus) -> Result<()> {
    if !status.state_dir_exists {
        bail!(
            "Runtime layout is not initialized.\nMissing: {}\nRun: rostersync init --project-root {}",
            normalize_for_display(&paths.state_dir),
            normalize_for_display(&paths.project_root)
        );
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env);
    if project_root.is_file() {
        bail!(
            "project root is a file, not a directory: {}",
            normalize_for_display(&project_root)
        );
    }
    let state_dir = project_root.join(STATE_DIR_NAME);

    let (config_path, config_source) = pick_path(
        overrides.config.as_deref(),
        lookup_env("ROSTERSYNC_CONFIG"),
        &project_root,
        state_dir.join(CONFIG_FILENAME),
    );
    let (db_path, db_source) = pick_path(
        overrides.db.as_deref(),
        lookup_env("ROSTERSYNC_DB"),
        &project_root,
        state_dir.join(DB_FILENAME),
    );

    Ok(ResolvedPaths {
        project_root,
        state_dir,
        config_path,
        db_path,
        root_source,
        config_source,
        db_source,
    })
}

fn pick_path(
    flag: Option<&Path>,
    env_value: Option<String>,
    project_root: &Path,
    default: PathBuf,
) -> (PathBuf, ValueSource) {
    if let Some(path) = flag {
        return (absolutize(path, project_root), ValueSource::Flag);
    }
    if let Some(value) = env_value.filter(|value| !value.trim().is_empty()) {
        return (
            absolutize(Path::new(value.trim()), project_root),
            ValueSource::Env,
        );
    }
    (default, ValueSource::Default)
}

pub fn init_layout(paths: &ResolvedPaths, force: bool) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    let mut required_dirs = vec![paths.state_dir.clone()];
    if let Some(parent) = paths.db_path.parent() {
        required_dirs.push(parent.to_path_buf());
    }

    for dir in &required_dirs {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = write_text_file(&paths.config_path, default_config_toml(), force)?;
    Ok(InitReport {
        created_dirs,
        wrote_config,
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
    if let Some(value) = lookup_env("ROSTERSYNC_PROJECT_ROOT")
        .filter(|value| !value.trim().is_empty())
    {
        return (
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        );
    }
    match detect_project_root(&context.cwd) {
        Some(root) => (root, ValueSource::Heuristic),
        None => (context.cwd.clone(), ValueSource::Default),
    }
}

/// Nearest ancestor of `cwd` that already holds a state directory.
fn detect_project_root(cwd: &Path) -> Option<PathBuf> {
    cwd.ancestors()
        .find(|candidate| candidate.join(STATE_DIR_NAME).is_dir())
        .map(Path::to_path_buf)
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use super::{
        PathOverrides, ResolutionContext, ValueSource, ensure_runtime_ready, init_layout,
        inspect_runtime, resolve_paths_with_lookup,
    };
    use crate::config::{RosterConfig, load_config};

    #[test]
    fn resolve_paths_prefers_flag_over_env() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path().join("cwd");
        let from_flag = temp.path().join("flag-root");
        fs::create_dir_all(&cwd).expect("create cwd");

        let overrides = PathOverrides {
            project_root: Some(from_flag.clone()),
            ..PathOverrides::default()
        };
        let context = ResolutionContext { cwd };
        let env = HashMap::from([(
            "ROSTERSYNC_PROJECT_ROOT".to_string(),
            temp.path().join("env-root").to_string_lossy().to_string(),
        )]);

        let resolved = resolve_paths_with_lookup(&context, &overrides, |key| env.get(key).cloned())
            .expect("resolve paths");
        assert_eq!(resolved.project_root, from_flag);
        assert_eq!(resolved.root_source, ValueSource::Flag);
        assert_eq!(resolved.db_path, from_flag.join(".rostersync").join("roster.db"));
        assert_eq!(resolved.db_source, ValueSource::Default);
    }

    #[test]
    fn project_root_is_found_from_nested_directory() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let nested = root.join("a").join("b");
        fs::create_dir_all(root.join(".rostersync")).expect("state dir");
        fs::create_dir_all(&nested).expect("nested");

        let context = ResolutionContext { cwd: nested };
        let resolved = resolve_paths_with_lookup(&context, &PathOverrides::default(), |_| None)
            .expect("resolve");
        assert_eq!(resolved.project_root, root);
        assert_eq!(resolved.root_source, ValueSource::Heuristic);
    }

    #[test]
    fn db_path_precedence_is_flag_env_config_default() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().to_path_buf();
        let context = ResolutionContext { cwd: root.clone() };
        let env = HashMap::from([("ROSTERSYNC_DB".to_string(), "env.db".to_string())]);
        let config = RosterConfig {
            store: crate::config::StoreSection {
                path: Some("data/config.db".to_string()),
            },
            ..RosterConfig::default()
        };

        let flagged = PathOverrides {
            project_root: Some(root.clone()),
            db: Some("flag.db".into()),
            ..PathOverrides::default()
        };
        let mut paths = resolve_paths_with_lookup(&context, &flagged, |key| env.get(key).cloned())
            .expect("resolve");
        paths.apply_config(&config);
        assert_eq!(paths.db_path, root.join("flag.db"));
        assert_eq!(paths.db_source, ValueSource::Flag);

        let plain = PathOverrides {
            project_root: Some(root.clone()),
            ..PathOverrides::default()
        };
        let mut paths = resolve_paths_with_lookup(&context, &plain, |key| env.get(key).cloned())
            .expect("resolve");
        paths.apply_config(&config);
        assert_eq!(paths.db_path, root.join("env.db"));
        assert_eq!(paths.db_source, ValueSource::Env);

        let mut paths = resolve_paths_with_lookup(&context, &plain, |_| None).expect("resolve");
        paths.apply_config(&config);
        assert_eq!(paths.db_path, root.join("data").join("config.db"));
        assert_eq!(paths.db_source, ValueSource::Config);
        assert!(paths.diagnostics().contains("(config)"));
    }

    #[test]
    fn init_layout_writes_loadable_config_once() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("create root");
        let context = ResolutionContext { cwd: root.clone() };
        let overrides = PathOverrides {
            project_root: Some(root),
            ..PathOverrides::default()
        };
        let paths = resolve_paths_with_lookup(&context, &overrides, |_| None).expect("resolve");

        let report = init_layout(&paths, false).expect("init");
        assert!(report.wrote_config);
        assert!(paths.state_dir.exists());
        load_config(&paths.config_path).expect("generated config loads");

        let again = init_layout(&paths, false).expect("init again");
        assert!(!again.wrote_config);
        assert!(again.created_dirs.is_empty());
        assert!(init_layout(&paths, true).expect("forced").wrote_config);
    }

    #[test]
    fn readiness_fails_without_init() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("create root");
        let context = ResolutionContext { cwd: root.clone() };
        let overrides = PathOverrides {
            project_root: Some(root),
            ..PathOverrides::default()
        };
        let paths = resolve_paths_with_lookup(&context, &overrides, |_| None).expect("resolve");
        let status = inspect_runtime(&paths).expect("inspect");
        assert!(!status.warnings.is_empty());
        let err = ensure_runtime_ready(&paths, &status).expect_err("must fail");
        assert!(err.to_string().contains("Runtime layout is not initialized"));
    }

    #[test]
    fn status_after_init_reports_config_and_missing_db() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("create root");
        let context = ResolutionContext { cwd: root.clone() };
        let overrides = PathOverrides {
            project_root: Some(root),
            ..PathOverrides::default()
        };
        let paths = resolve_paths_with_lookup(&context, &overrides, |_| None).expect("resolve");
        init_layout(&paths, false).expect("init");

        let status = inspect_runtime(&paths).expect("inspect");
        assert!(status.config_exists);
        assert!(!status.db_exists);
        assert_eq!(status.db_size_bytes, None);
        assert!(status.warnings.is_empty());
        ensure_runtime_ready(&paths, &status).expect("ready");

        fs::write(&paths.db_path, b"0123").expect("write db");
        let status = inspect_runtime(&paths).expect("inspect again");
        assert!(status.db_exists);
        assert_eq!(status.db_size_bytes, Some(4));
    }
}
