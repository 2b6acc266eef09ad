// keg/src/cli/uninstall.rs
use clap::Args;
use colored::Colorize;
use keg_common::config::Config;
use keg_common::error::{KegError, Result};
use keg_common::model::version::VersionConstraint;
use keg_common::state::InstallStateStore;
use keg_core::{uninstall_formula, UninstallOptions};
use tracing::debug;

#[derive(Args, Debug)]
pub struct Uninstall {
    /// Formulae to remove; `name@version` removes only matching versions
    #[arg(required = true, value_name = "FORMULA[@VERSION]")]
    pub names: Vec<String>,
    #[arg(
        long,
        help = "Uninstall even if other installed formulae depend on the target"
    )]
    pub ignore_dependencies: bool,
}

impl Uninstall {
    pub fn run(&self, config: &Config) -> Result<i32> {
        let state = InstallStateStore::from_config(config)?;
        let options = UninstallOptions {
            ignore_dependencies: self.ignore_dependencies,
        };
        let mut errors: Vec<(String, KegError)> = Vec::new();

        for raw in &self.names {
            let result = parse_installed_target(raw, &state).and_then(|(name, constraint)| {
                debug!("Uninstalling {} (constraint {:?})", name, constraint);
                uninstall_formula(&name, constraint.as_ref(), config, &state, &options)
            });
            match result {
                Ok(removed) => {
                    for record in removed {
                        println!(
                            "✓ Uninstalled {} {} ({} files)",
                            record.name.green(),
                            record.version,
                            record.manifest.len()
                        );
                    }
                }
                Err(e) => {
                    debug!("Failed to uninstall '{}': {}", raw.cyan(), e);
                    eprintln!("{} {}: {}", "✗".red().bold(), raw.cyan(), e);
                    errors.push((raw.clone(), e));
                }
            }
        }

        Ok(errors.iter().map(|(_, e)| e.exit_code()).max().unwrap_or(0))
    }
}

/// Splits `name@version` unless `raw` is itself an installed formula name
/// (versioned names such as `amqp@8.1` contain `@`).
fn parse_installed_target(
    raw: &str,
    state: &InstallStateStore,
) -> Result<(String, Option<VersionConstraint>)> {
    if raw.contains('/') || raw.contains("..") {
        return Err(KegError::Usage(format!(
            "invalid formula name '{raw}' contains disallowed characters"
        )));
    }
    if !state.versions(raw).is_empty() {
        return Ok((raw.to_string(), None));
    }
    match raw.rsplit_once('@') {
        Some((name, version)) if !name.is_empty() && !version.is_empty() => {
            let constraint = VersionConstraint::parse(version)
                .map_err(|e| KegError::Usage(format!("invalid target '{raw}': {e}")))?;
            Ok((name.to_string(), Some(constraint)))
        }
        _ => Ok((raw.to_string(), None)),
    }
}
