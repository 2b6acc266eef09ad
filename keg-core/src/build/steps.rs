// keg-core/src/build/steps.rs
// Placeholder expansion and the file-level steps of an install procedure.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use keg_aio::fs::{atomic_write_file, copy_file, create_dir_all, create_symlink};
use keg_common::config::Config;
use keg_common::error::{KegError, Result};
use regex::{Captures, Regex};
use tracing::debug;
use walkdir::WalkDir;

const PLACEHOLDER_PATTERN: &str = r"\{([a-z_]+)(?::([A-Za-z0-9@._+-]+))?\}";

/// Values substituted into step arguments.
#[derive(Debug)]
pub struct StepContext {
    pattern: Regex,
    values: HashMap<&'static str, String>,
    opt_dir: PathBuf,
}

impl StepContext {
    pub fn new(
        config: &Config,
        name: &str,
        version: &str,
        prefix: &Path,
        work_dir: &Path,
    ) -> Result<Self> {
        let pattern = Regex::new(PLACEHOLDER_PATTERN)
            .map_err(|e| KegError::Generic(format!("invalid placeholder pattern: {e}")))?;
        let values = HashMap::from([
            ("prefix", prefix.to_string_lossy().into_owned()),
            ("keg_root", config.keg_root().to_string_lossy().into_owned()),
            ("name", name.to_string()),
            ("version", version.to_string()),
            ("jobs", config.jobs.max(1).to_string()),
            ("work_dir", work_dir.to_string_lossy().into_owned()),
        ]);
        Ok(Self {
            pattern,
            values,
            opt_dir: config.opt_dir(),
        })
    }

    /// Replaces known placeholders; anything else is kept verbatim.
    pub fn expand(&self, raw: &str) -> String {
        self.pattern
            .replace_all(raw, |caps: &Captures| {
                let key = &caps[1];
                match (key, caps.get(2)) {
                    ("opt", Some(dep)) => self.opt_dir.join(dep.as_str()).to_string_lossy().into_owned(),
                    (_, None) => self
                        .values
                        .get(key)
                        .cloned()
                        .unwrap_or_else(|| caps[0].to_string()),
                    _ => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    pub fn expand_all(&self, args: &[String]) -> Vec<String> {
        args.iter().map(|a| self.expand(a)).collect()
    }
}

/// Joins a formula-supplied relative path onto `base`, refusing absolute
/// paths and `..` so steps cannot write outside their directory.
pub fn confined_join(base: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    if rel
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        return Err(KegError::ValidationError(format!(
            "path '{relative}' escapes {}",
            base.display()
        )));
    }
    Ok(base.join(rel))
}

/// Copies a file, directory tree or symlink to `dest`.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
    {
        let entry = entry.map_err(|e| KegError::Generic(format!("walking {}: {e}", src.display())))?;
        let relative = entry.path().strip_prefix(src).unwrap_or(Path::new(""));
        let target = if relative.as_os_str().is_empty() {
            dest.to_path_buf()
        } else {
            dest.join(relative)
        };
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            create_symlink(&fs::read_link(entry.path())?, &target)?;
        } else if file_type.is_dir() {
            create_dir_all(&target)?;
        } else {
            copy_file(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Copies everything matching `pattern` (relative to `cwd`) into `dest_dir`.
/// Returns how many top-level matches were copied.
pub fn install_matching(cwd: &Path, pattern: &str, dest_dir: &Path) -> Result<usize> {
    let full_pattern = cwd.join(pattern);
    let matches = glob::glob(&full_pattern.to_string_lossy())
        .map_err(|e| KegError::ValidationError(format!("invalid pattern '{pattern}': {e}")))?;
    let mut copied = 0;
    for entry in matches {
        let src = entry.map_err(|e| KegError::Generic(e.to_string()))?;
        let Some(file_name) = src.file_name() else {
            continue;
        };
        let target = dest_dir.join(file_name);
        debug!("Installing {} -> {}", src.display(), target.display());
        copy_tree(&src, &target)?;
        copied += 1;
    }
    Ok(copied)
}

pub fn write_into(base: &Path, relative: &str, contents: &str) -> Result<PathBuf> {
    let path = confined_join(base, relative)?;
    atomic_write_file(&path, contents.as_bytes())?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> (tempfile::TempDir, StepContext) {
        let root = tempfile::tempdir().unwrap();
        let mut config = Config::with_root(root.path());
        config.jobs = 4;
        let keg = config.formula_keg_path("amqp@8.1", "1.11.0");
        let ctx = StepContext::new(&config, "amqp@8.1", "1.11.0", &keg, Path::new("/tmp/work")).unwrap();
        (root, ctx)
    }

    #[test]
    fn expands_known_placeholders() {
        let (root, ctx) = context();
        let r = root.path().display();
        assert_eq!(
            ctx.expand("--prefix={prefix}"),
            format!("--prefix={r}/Cellar/amqp@8.1/1.11.0")
        );
        assert_eq!(
            ctx.expand("--with-librabbitmq-dir={opt:rabbitmq-c}"),
            format!("--with-librabbitmq-dir={r}/opt/rabbitmq-c")
        );
        assert_eq!(ctx.expand("-j{jobs} {name}-{version}"), "-j4 amqp@8.1-1.11.0");
        assert_eq!(ctx.expand("{work_dir}/src"), "/tmp/work/src");
    }

    #[test]
    fn unknown_placeholders_and_shell_syntax_survive() {
        let (_root, ctx) = context();
        assert_eq!(ctx.expand("{unknown} ${HOME} {PREFIX}"), "{unknown} ${HOME} {PREFIX}");
    }

    #[test]
    fn confined_paths_reject_escapes() {
        let base = Path::new("/opt/keg/Cellar/x/1.0.0");
        assert!(confined_join(base, "etc/x.ini").is_ok());
        assert!(confined_join(base, "../../../etc/passwd").is_err());
        assert!(confined_join(base, "/etc/passwd").is_err());
    }

    #[test]
    fn installs_glob_matches() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("modules")).unwrap();
        fs::write(src.path().join("modules/amqp.so"), b"so").unwrap();
        fs::write(src.path().join("modules/amqp.la"), b"la").unwrap();
        let copied = install_matching(src.path(), "modules/*.so", &dest.path().join("lib")).unwrap();
        assert_eq!(copied, 1);
        assert!(dest.path().join("lib/amqp.so").is_file());
        assert!(!dest.path().join("lib/amqp.la").exists());
    }
}
