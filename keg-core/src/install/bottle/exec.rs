// keg-core/src/install/bottle/exec.rs
// Pouring a verified bottle into its keg.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use keg_aio::extract::extract_archive;
use keg_aio::fs::atomic_write_file;
use keg_common::config::Config;
use keg_common::error::{KegError, Result};
use keg_common::model::formula::{BottleDescriptor, CellarPolicy, Formula};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Bottles wrap their payload in `<name>/<version>/`.
const BOTTLE_STRIP_COMPONENTS: usize = 2;
/// Files with a NUL byte in this prefix are treated as binary.
const BINARY_SNIFF_LEN: usize = 8000;

/// Unpacks `bottle_path` into the keg for `formula`, replacing any previous
/// content, and relocates it unless the bottle opts out. Returns the keg path.
pub fn pour_bottle(
    bottle_path: &Path,
    formula: &Formula,
    bottle: &BottleDescriptor,
    config: &Config,
) -> Result<PathBuf> {
    let install_dir = config.formula_keg_path(formula.name(), &formula.version_str_full());
    if install_dir.exists() {
        debug!(
            "Removing existing keg directory before installing: {}",
            install_dir.display()
        );
        fs::remove_dir_all(&install_dir).map_err(|e| {
            KegError::InstallError(format!(
                "Failed to remove existing keg {}: {}",
                install_dir.display(),
                e
            ))
        })?;
    }
    fs::create_dir_all(&install_dir)?;

    debug!(
        "Extracting bottle archive {} to {} with strip_components={}",
        bottle_path.display(),
        install_dir.display(),
        BOTTLE_STRIP_COMPONENTS
    );
    let created = extract_archive(bottle_path, &install_dir, BOTTLE_STRIP_COMPONENTS)?;
    if created.is_empty() {
        return Err(KegError::InstallError(format!(
            "Bottle {} for {} is empty",
            bottle_path.display(),
            formula.name()
        )));
    }
    ensure_write_permissions(&install_dir);

    if bottle.cellar == CellarPolicy::AnySkipRelocation {
        debug!("Skipping relocation for {} (any_skip_relocation)", formula.name());
    } else {
        let patched = relocate_keg(&install_dir, config)?;
        debug!("Relocated {} text files in {}", patched, install_dir.display());
    }
    debug!(
        "Bottle installation complete for {} at {}",
        formula.name(),
        install_dir.display()
    );
    Ok(install_dir)
}

fn ensure_write_permissions(path: &Path) {
    for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
        if entry.depth() == 0 || entry.file_type().is_symlink() {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let mut perms = metadata.permissions();
        #[cfg(unix)]
        {
            let current_mode = perms.mode();
            let new_mode = current_mode | 0o200;
            if new_mode != current_mode {
                perms.set_mode(new_mode);
                let _ = fs::set_permissions(entry.path(), perms);
            }
        }
        #[cfg(not(unix))]
        if perms.readonly() {
            perms.set_readonly(false);
            let _ = fs::set_permissions(entry.path(), perms);
        }
    }
}

/// Placeholder to local path substitutions applied to poured text files.
pub fn relocation_table(config: &Config) -> HashMap<&'static str, String> {
    let prefix = config.keg_root().to_string_lossy().into_owned();
    let cellar = config.cellar_dir().to_string_lossy().into_owned();
    HashMap::from([
        ("@@HOMEBREW_PREFIX@@", prefix.clone()),
        ("@@HOMEBREW_CELLAR@@", cellar.clone()),
        ("@@KEG_PREFIX@@", prefix),
        ("@@KEG_CELLAR@@", cellar),
    ])
}

/// Rewrites placeholders in every text file below `keg`. Binary files and
/// symlinks are left untouched. Returns the number of files changed.
pub fn relocate_keg(keg: &Path, config: &Config) -> Result<usize> {
    let table = relocation_table(config);
    let mut patched = 0;
    for entry in WalkDir::new(keg).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if looks_binary(path)? {
            continue;
        }
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                debug!("Skipping non-UTF-8 file {}: {}", path.display(), e);
                continue;
            }
        };
        if !content.contains("@@") {
            continue;
        }
        let mut replaced = content.clone();
        for (placeholder, value) in &table {
            replaced = replaced.replace(placeholder, value);
        }
        if replaced != content {
            atomic_write_file(path, replaced.as_bytes())?;
            patched += 1;
            if replaced.contains("@@HOMEBREW_") {
                warn!("Unresolved placeholders remain in {}", path.display());
            }
        }
    }
    Ok(patched)
}

fn looks_binary(path: &Path) -> Result<bool> {
    let mut file = fs::File::open(path)?;
    let mut buf = [0u8; BINARY_SNIFF_LEN];
    let n = file.read(&mut buf)?;
    Ok(buf[..n].contains(&0))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use keg_common::model::platform::PlatformTag;

    use super::*;

    fn bottle_tarball(path: &Path, files: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o555);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap().flush().unwrap();
    }

    fn formula() -> Formula {
        keg_common::model::FormulaDescriptor::from_json(
            r#"{"name": "rabbitmq-c", "version": "0.14.0",
                "bottle": {"files": [{"tag": "x86_64_linux", "sha256": "00"}]}}"#,
        )
        .unwrap()
        .resolve(&HashMap::new())
        .unwrap()
    }

    fn descriptor(cellar: CellarPolicy) -> BottleDescriptor {
        BottleDescriptor {
            platform_tag: PlatformTag::new("x86_64_linux"),
            sha256: "00".into(),
            cellar,
            rebuild: 0,
            url: None,
        }
    }

    #[test]
    fn pours_and_relocates_text_files() {
        let root = tempfile::tempdir().unwrap();
        let config = Config::with_root(root.path());
        let bottle = root.path().join("rabbitmq-c.tar.gz");
        bottle_tarball(
            &bottle,
            &[
                (
                    "rabbitmq-c/0.14.0/lib/pkgconfig/librabbitmq.pc",
                    b"prefix=@@HOMEBREW_CELLAR@@/rabbitmq-c/0.14.0\n",
                ),
                ("rabbitmq-c/0.14.0/lib/librabbitmq.so", b"\x7fELF\0\0@@HOMEBREW_PREFIX@@"),
            ],
        );

        let keg = pour_bottle(&bottle, &formula(), &descriptor(CellarPolicy::Any), &config).unwrap();
        assert_eq!(keg, config.formula_keg_path("rabbitmq-c", "0.14.0"));
        let pc = fs::read_to_string(keg.join("lib/pkgconfig/librabbitmq.pc")).unwrap();
        assert_eq!(
            pc,
            format!("prefix={}/rabbitmq-c/0.14.0\n", config.cellar_dir().display())
        );
        let so = fs::read(keg.join("lib/librabbitmq.so")).unwrap();
        assert!(so.ends_with(b"@@HOMEBREW_PREFIX@@"));
    }

    #[test]
    fn skip_relocation_leaves_placeholders() {
        let root = tempfile::tempdir().unwrap();
        let config = Config::with_root(root.path());
        let bottle = root.path().join("b.tar.gz");
        bottle_tarball(&bottle, &[("rabbitmq-c/0.14.0/share/note", b"@@HOMEBREW_PREFIX@@")]);
        let keg = pour_bottle(
            &bottle,
            &formula(),
            &descriptor(CellarPolicy::AnySkipRelocation),
            &config,
        )
        .unwrap();
        assert_eq!(
            fs::read_to_string(keg.join("share/note")).unwrap(),
            "@@HOMEBREW_PREFIX@@"
        );
    }
}
