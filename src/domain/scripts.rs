use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};

use tracing::{info, warn};

use super::error::{SupervisorError, SupervisorResult};

pub const DEFAULT_KNOWN_SUBDIR: &str = "simple";
const SCRIPTS_ROOT_ENV: &str = "TRAINSCOPE_SCRIPTS_ROOT";

/// A logical script name resolved to an absolute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRef {
    pub name: String,
    pub path: PathBuf,
    pub working_dir: PathBuf,
}

impl ScriptRef {
    fn new(name: &str, path: PathBuf) -> Self {
        let working_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            name: name.to_string(),
            path,
            working_dir,
        }
    }
}

/// Resolves script names against an ordered list of directories and
/// remembers every successful lookup for the lifetime of the locator.
#[derive(Debug)]
pub struct ScriptLocator {
    own_dir: Option<PathBuf>,
    cwd: PathBuf,
    known_subdir: PathBuf,
    extra_root: Option<PathBuf>,
    search_path: Vec<PathBuf>,
    cache: Mutex<HashMap<String, ScriptRef>>,
}

static GLOBAL_LOCATOR: OnceLock<ScriptLocator> = OnceLock::new();

impl ScriptLocator {
    /// Locator rooted at the running executable and the current directory.
    pub fn from_env(known_subdir: impl Into<PathBuf>) -> Self {
        let own_dir = env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let search_path = env::var_os("PATH")
            .map(|value| env::split_paths(&value).collect())
            .unwrap_or_default();
        Self {
            own_dir,
            cwd,
            known_subdir: known_subdir.into(),
            extra_root: scripts_root_override(),
            search_path,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Locator with explicit roots; nothing is read from the environment.
    pub fn with_roots(own_dir: Option<PathBuf>, cwd: PathBuf) -> Self {
        Self {
            own_dir,
            cwd,
            known_subdir: PathBuf::from(DEFAULT_KNOWN_SUBDIR),
            extra_root: None,
            search_path: Vec::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_known_subdir(mut self, subdir: impl Into<PathBuf>) -> Self {
        self.known_subdir = subdir.into();
        self
    }

    pub fn with_extra_root(mut self, root: Option<PathBuf>) -> Self {
        self.extra_root = root;
        self
    }

    pub fn with_search_path(mut self, dirs: Vec<PathBuf>) -> Self {
        self.search_path = dirs;
        self
    }

    /// Process-wide locator. The first caller decides the known subdirectory.
    pub fn global(known_subdir: &str) -> &'static ScriptLocator {
        GLOBAL_LOCATOR.get_or_init(|| ScriptLocator::from_env(known_subdir))
    }

    pub fn resolve(&self, name: &str) -> SupervisorResult<ScriptRef> {
        if let Some(found) = self.cached(name) {
            return Ok(found);
        }

        for candidate in self.candidates(name) {
            if candidate.is_file() {
                let absolute = absolutize(&self.cwd, &candidate);
                let script = ScriptRef::new(name, absolute);
                info!(script = name, path = %script.path.display(), "resolved script");
                self.cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(name.to_string(), script.clone());
                return Ok(script);
            }
        }

        warn!(script = name, "script not found in any search location");
        Err(SupervisorError::NotFound {
            name: name.to_string(),
        })
    }

    /// Reports which of `names` cannot be resolved.
    pub fn missing<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        names
            .into_iter()
            .filter(|name| self.resolve(name).is_err())
            .map(str::to_string)
            .collect()
    }

    pub fn cached(&self, name: &str) -> Option<ScriptRef> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn candidates(&self, name: &str) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(dir) = &self.own_dir {
            paths.push(dir.join(name));
        }
        paths.push(self.cwd.join(name));
        paths.push(self.cwd.join(&self.known_subdir).join(name));
        if let Some(parent) = self.cwd.parent() {
            paths.push(parent.join(name));
        }
        if let Some(root) = &self.extra_root {
            paths.push(root.join(name));
        }
        // Bare name: whatever the search path would pick up.
        paths.extend(self.search_path.iter().map(|dir| dir.join(name)));
        paths
    }
}

fn absolutize(cwd: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    };
    joined.canonicalize().unwrap_or(joined)
}

fn scripts_root_override() -> Option<PathBuf> {
    env::var(SCRIPTS_ROOT_ENV).ok().and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "#!/bin/sh\n").unwrap();
    }

    #[test]
    fn own_dir_wins_over_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let own = dir.path().join("bin");
        let cwd = dir.path().join("work");
        touch(&own.join("train.py"));
        touch(&cwd.join("train.py"));

        let locator = ScriptLocator::with_roots(Some(own.clone()), cwd);
        let found = locator.resolve("train.py").unwrap();
        assert_eq!(found.path, own.join("train.py").canonicalize().unwrap());
        assert_eq!(found.working_dir, own.canonicalize().unwrap());
    }

    #[test]
    fn falls_back_through_subdir_and_parent() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = dir.path().join("work");
        fs::create_dir_all(&cwd).unwrap();
        touch(&cwd.join("simple").join("predict.py"));
        touch(&dir.path().join("view_results.py"));

        let locator = ScriptLocator::with_roots(None, cwd.clone());
        let predict = locator.resolve("predict.py").unwrap();
        assert!(predict.path.ends_with("simple/predict.py"));
        let view = locator.resolve("view_results.py").unwrap();
        assert_eq!(
            view.path,
            dir.path().join("view_results.py").canonicalize().unwrap()
        );
    }

    #[test]
    fn directories_are_not_scripts() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("train.py")).unwrap();
        let locator = ScriptLocator::with_roots(None, dir.path().to_path_buf());
        assert!(matches!(
            locator.resolve("train.py"),
            Err(SupervisorError::NotFound { .. })
        ));
    }

    #[test]
    fn search_path_is_consulted_last() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("usr-bin");
        touch(&bin.join("visualize"));
        let locator = ScriptLocator::with_roots(None, dir.path().join("empty"))
            .with_search_path(vec![bin.clone()]);
        let found = locator.resolve("visualize").unwrap();
        assert_eq!(found.path, bin.join("visualize").canonicalize().unwrap());
    }

    #[test]
    fn results_are_cached_even_after_file_disappears() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("train.py");
        touch(&script);
        let locator = ScriptLocator::with_roots(None, dir.path().to_path_buf());
        let first = locator.resolve("train.py").unwrap();
        fs::remove_file(&script).unwrap();
        let second = locator.resolve("train.py").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_lists_unresolved_names() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("predict.py"));
        let locator = ScriptLocator::with_roots(None, dir.path().to_path_buf());
        let missing = locator.missing(["predict.py", "gradient_descent_3d.py"]);
        assert_eq!(missing, vec!["gradient_descent_3d.py".to_string()]);
    }
}
