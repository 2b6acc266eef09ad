// keg-common/src/model/step.rs
//! Typed install procedure steps and reusable step templates.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{KegError, Result};
use crate::pipeline::BuildPhase;

pub const AUTOTOOLS_TEMPLATE: &str = "autotools";

/// One instruction of a formula's install procedure.
///
/// String arguments may contain placeholders that the executor expands:
/// `{prefix}`, `{keg_root}`, `{name}`, `{version}`, `{jobs}`, `{work_dir}`
/// and `{opt:<dependency>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Fetch the formula's source archive into the download cache.
    Download,
    /// Unpack the source archive into the working directory.
    Extract,
    /// Change the working directory, relative to the current one.
    Chdir { path: String },
    /// Run an arbitrary tool (e.g. `phpize`) in the working directory.
    Run {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Run `./configure` with the given arguments.
    Configure {
        #[serde(default)]
        args: Vec<String>,
    },
    /// Run `make` with the given arguments.
    Make {
        #[serde(default)]
        args: Vec<String>,
    },
    /// Copy files matching a glob (relative to the working directory) into the keg.
    InstallFiles {
        pattern: String,
        #[serde(default = "default_install_dest")]
        dest: String,
    },
    /// Write a file into the keg.
    WriteFile { path: String, contents: String },
}

fn default_install_dest() -> String {
    ".".to_string()
}

impl Step {
    pub fn phase(&self) -> BuildPhase {
        match self {
            Step::Download => BuildPhase::Fetching,
            Step::Extract => BuildPhase::Extracting,
            Step::Chdir { .. } | Step::Run { .. } | Step::Configure { .. } => {
                BuildPhase::Configuring
            }
            Step::Make { .. } => BuildPhase::Compiling,
            Step::InstallFiles { .. } | Step::WriteFile { .. } => BuildPhase::Installing,
        }
    }

    /// Short label used in logs and build errors.
    pub fn label(&self) -> String {
        match self {
            Step::Download => "download".to_string(),
            Step::Extract => "extract".to_string(),
            Step::Chdir { path } => format!("chdir {path}"),
            Step::Run { program, .. } => program.clone(),
            Step::Configure { .. } => "configure".to_string(),
            Step::Make { args } if args.is_empty() => "make".to_string(),
            Step::Make { args } => format!("make {}", args.join(" ")),
            Step::InstallFiles { pattern, .. } => format!("install {pattern}"),
            Step::WriteFile { path, .. } => format!("write {path}"),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// A step inside a template, optionally named so formulae can replace it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub step: Step,
}

impl TemplateStep {
    fn named(id: &str, step: Step) -> Self {
        Self {
            id: Some(id.to_string()),
            step,
        }
    }
}

/// Shared install scaffolding reused across many formulae.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTemplate {
    pub name: String,
    pub steps: Vec<TemplateStep>,
}

impl StepTemplate {
    /// `./configure --prefix && make && make install`.
    pub fn autotools() -> Self {
        Self {
            name: AUTOTOOLS_TEMPLATE.to_string(),
            steps: vec![
                TemplateStep::named("download", Step::Download),
                TemplateStep::named("extract", Step::Extract),
                TemplateStep::named(
                    "configure",
                    Step::Configure {
                        args: vec!["--prefix={prefix}".to_string()],
                    },
                ),
                TemplateStep::named("make", Step::Make { args: Vec::new() }),
                TemplateStep::named(
                    "install",
                    Step::Make {
                        args: vec!["install".to_string()],
                    },
                ),
            ],
        }
    }

    /// Produces the concrete step list for a formula: template steps with
    /// overrides applied by id, followed by the formula's extra steps.
    pub fn instantiate(
        &self,
        overrides: &HashMap<String, Step>,
        extra_steps: &[Step],
    ) -> Result<Vec<Step>> {
        for id in overrides.keys() {
            if !self.steps.iter().any(|s| s.id.as_deref() == Some(id.as_str())) {
                return Err(KegError::ValidationError(format!(
                    "step override '{id}' does not name a step of template '{}'",
                    self.name
                )));
            }
        }
        let mut steps: Vec<Step> = self
            .steps
            .iter()
            .map(|ts| {
                ts.id
                    .as_ref()
                    .and_then(|id| overrides.get(id))
                    .cloned()
                    .unwrap_or_else(|| ts.step.clone())
            })
            .collect();
        steps.extend(extra_steps.iter().cloned());
        Ok(steps)
    }
}

/// Checks that steps never move backwards through the build phases, e.g. a
/// `configure` after `make install`.
pub fn validate_step_order(steps: &[Step]) -> Result<()> {
    let mut last = BuildPhase::Pending;
    for step in steps {
        let phase = step.phase();
        if phase < last {
            return Err(KegError::ValidationError(format!(
                "step '{}' ({phase}) cannot follow a {last} step",
                step.label()
            )));
        }
        last = phase;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_deserialize_from_tagged_json() {
        let json = r#"[
            {"type": "download"},
            {"type": "run", "program": "phpize"},
            {"type": "configure", "args": ["--prefix={prefix}"]},
            {"type": "install_files", "pattern": "modules/*.so"}
        ]"#;
        let steps: Vec<Step> = serde_json::from_str(json).unwrap();
        assert_eq!(steps[0], Step::Download);
        assert_eq!(
            steps[1],
            Step::Run {
                program: "phpize".into(),
                args: vec![]
            }
        );
        assert_eq!(
            steps[3],
            Step::InstallFiles {
                pattern: "modules/*.so".into(),
                dest: ".".into()
            }
        );
    }

    #[test]
    fn template_steps_carry_optional_ids() {
        let json = r#"{"name": "ext", "steps": [
            {"id": "configure", "type": "configure"},
            {"type": "make"}
        ]}"#;
        let template: StepTemplate = serde_json::from_str(json).unwrap();
        assert_eq!(template.steps[0].id.as_deref(), Some("configure"));
        assert_eq!(template.steps[1].id, None);
    }

    #[test]
    fn overrides_replace_steps_by_id() {
        let template = StepTemplate::autotools();
        let mut overrides = HashMap::new();
        overrides.insert(
            "configure".to_string(),
            Step::Configure {
                args: vec!["--prefix={prefix}".into(), "--with-amqp=shared".into()],
            },
        );
        let extra = vec![Step::WriteFile {
            path: "ext.ini".into(),
            contents: "extension=amqp.so".into(),
        }];
        let steps = template.instantiate(&overrides, &extra).unwrap();
        assert_eq!(steps.len(), 6);
        assert_eq!(
            steps[2],
            Step::Configure {
                args: vec!["--prefix={prefix}".into(), "--with-amqp=shared".into()]
            }
        );
        assert!(matches!(steps[5], Step::WriteFile { .. }));
    }

    #[test]
    fn unknown_override_is_rejected() {
        let mut overrides = HashMap::new();
        overrides.insert("compile".to_string(), Step::Make { args: vec![] });
        assert!(StepTemplate::autotools()
            .instantiate(&overrides, &[])
            .is_err());
    }

    #[test]
    fn backwards_phase_order_is_rejected() {
        let ok = StepTemplate::autotools().instantiate(&HashMap::new(), &[]).unwrap();
        assert!(validate_step_order(&ok).is_ok());

        let bad = vec![Step::Make { args: vec![] }, Step::Configure { args: vec![] }];
        assert!(validate_step_order(&bad).is_err());
    }
}
