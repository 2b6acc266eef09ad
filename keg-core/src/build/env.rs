// keg-core/src/build/env.rs
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use keg_common::config::Config;
use tracing::debug;

const FALLBACK_SYSTEM_PATH: &str = "/usr/bin:/bin:/usr/sbin:/sbin";

/// Variables the executor owns; inherited values are replaced, not extended.
const CONTROLLED_VARS: &[&str] = &["PATH", "PKG_CONFIG_PATH", "CPPFLAGS", "LDFLAGS", "MAKEFLAGS"];

/// Environment for build tools, assembled from the opt prefixes of a
/// formula's dependencies.
#[derive(Debug, Clone)]
pub struct BuildEnvironment {
    vars: HashMap<String, String>,
    path_dirs: Vec<PathBuf>,
}

impl BuildEnvironment {
    pub fn new(config: &Config, dependencies: &[String]) -> Self {
        let dep_prefixes: Vec<PathBuf> = dependencies
            .iter()
            .map(|d| config.formula_opt_path(d))
            .collect();

        let mut path_dirs = Vec::new();
        for prefix in &dep_prefixes {
            for sub in ["bin", "sbin"] {
                let dir = prefix.join(sub);
                if dir.is_dir() {
                    path_dirs.push(dir);
                }
            }
        }
        path_dirs.push(config.bin_dir());
        let inherited = env::var_os("PATH")
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| FALLBACK_SYSTEM_PATH.into());
        for dir in env::split_paths(&inherited) {
            if !path_dirs.contains(&dir) {
                path_dirs.push(dir);
            }
        }

        let existing = |sub: &str| -> Vec<PathBuf> {
            dep_prefixes
                .iter()
                .map(|p| p.join(sub))
                .filter(|p| p.is_dir())
                .collect()
        };
        let pkg_config: Vec<PathBuf> = existing("lib/pkgconfig")
            .into_iter()
            .chain(existing("share/pkgconfig"))
            .collect();
        let cppflags = flags("-I", &existing("include"));
        let ldflags = flags("-L", &existing("lib"));

        let mut vars = HashMap::new();
        vars.insert("PATH".to_string(), join_paths(&path_dirs));
        vars.insert("PKG_CONFIG_PATH".to_string(), join_paths(&pkg_config));
        vars.insert("CPPFLAGS".to_string(), cppflags);
        vars.insert("LDFLAGS".to_string(), ldflags);
        vars.insert("MAKEFLAGS".to_string(), format!("-j{}", config.jobs.max(1)));
        debug!(
            "Build environment for deps {:?}: {:?}",
            dependencies,
            CONTROLLED_VARS
                .iter()
                .map(|k| (k, vars.get(*k)))
                .collect::<Vec<_>>()
        );
        Self { vars, path_dirs }
    }

    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }

    pub fn path_dirs(&self) -> &[PathBuf] {
        &self.path_dirs
    }
}

fn flags(flag: &str, dirs: &[PathBuf]) -> String {
    dirs.iter()
        .map(|d| format!("{flag}{}", d.display()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn join_paths(dirs: &[PathBuf]) -> String {
    dirs.iter()
        .map(|d: &PathBuf| d.as_path())
        .map(Path::to_string_lossy)
        .collect::<Vec<_>>()
        .join(":")
}
