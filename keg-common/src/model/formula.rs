// keg-common/src/model/formula.rs
// Formula descriptors as read from disk and the resolved, immutable `Formula`
// the rest of keg works with.

use std::collections::{HashMap, HashSet};
use std::fmt;

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::dependency::{Dependency, DependencyExt};
use crate::error::{KegError, Result};
use crate::model::platform::PlatformTag;
use crate::model::step::{validate_step_order, Step, StepTemplate, AUTOTOOLS_TEMPLATE};
use crate::model::version::parse_version_lenient;

/// Where a bottle expects to be poured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CellarPolicy {
    /// Relocatable; text files carry placeholders rewritten on pour.
    #[default]
    Any,
    /// Relocatable without rewriting anything.
    AnySkipRelocation,
    /// Only usable when the local cellar is exactly this path.
    Path(String),
}

impl From<String> for CellarPolicy {
    fn from(raw: String) -> Self {
        match raw.trim_start_matches(':') {
            "any" => CellarPolicy::Any,
            "any_skip_relocation" => CellarPolicy::AnySkipRelocation,
            _ => CellarPolicy::Path(raw),
        }
    }
}

impl From<CellarPolicy> for String {
    fn from(policy: CellarPolicy) -> Self {
        match policy {
            CellarPolicy::Any => "any".to_string(),
            CellarPolicy::AnySkipRelocation => "any_skip_relocation".to_string(),
            CellarPolicy::Path(p) => p,
        }
    }
}

impl fmt::Display for CellarPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellarPolicy::Any => f.write_str("any"),
            CellarPolicy::AnySkipRelocation => f.write_str("any_skip_relocation"),
            CellarPolicy::Path(p) => f.write_str(p),
        }
    }
}

/// A precomputed binary artifact for one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BottleDescriptor {
    pub platform_tag: PlatformTag,
    pub sha256: String,
    pub cellar: CellarPolicy,
    pub rebuild: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BottleSpec {
    #[serde(default)]
    pub root_url: Option<String>,
    #[serde(default)]
    pub rebuild: u32,
    #[serde(default)]
    pub files: Vec<BottleFileSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BottleFileSpec {
    pub tag: String,
    pub sha256: String,
    #[serde(default)]
    pub cellar: CellarPolicy,
    #[serde(default)]
    pub rebuild: Option<u32>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Development checkout used by `--HEAD` installs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadSpec {
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
}

/// A formula file exactly as written on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct FormulaDescriptor {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub revision: u32,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub mirrors: Vec<String>,
    #[serde(default)]
    pub head: Option<HeadSpec>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub bottle: BottleSpec,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub step_overrides: HashMap<String, Step>,
    #[serde(default)]
    pub extra_steps: Vec<Step>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub force_source: bool,
}

impl FormulaDescriptor {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Validates the descriptor and expands its template into a concrete step
    /// list. `templates` must contain every template the descriptor names.
    pub fn resolve(self, templates: &HashMap<String, StepTemplate>) -> Result<Formula> {
        let name = self.name.trim().to_string();
        if name.is_empty() || name.contains(char::is_whitespace) || name.contains('/') {
            return Err(KegError::ValidationError(format!(
                "invalid formula name '{}'",
                self.name
            )));
        }
        let version = parse_version_lenient(&self.version)?;

        if self.url.is_empty() && self.head.is_none() && self.bottle.files.is_empty() {
            return Err(KegError::ValidationError(format!(
                "formula '{name}' has no source url, head or bottles"
            )));
        }
        if !self.url.is_empty() && self.sha256.is_empty() {
            return Err(KegError::ValidationError(format!(
                "formula '{name}' has a source url but no sha256"
            )));
        }

        let install_steps = self.install_steps(&name, templates)?;
        validate_step_order(&install_steps)
            .map_err(|e| KegError::ValidationError(format!("formula '{name}': {e}")))?;

        let mut seen = HashSet::new();
        let mut bottles = Vec::with_capacity(self.bottle.files.len());
        for file in self.bottle.files {
            let rebuild = file.rebuild.unwrap_or(self.bottle.rebuild);
            if !seen.insert((file.tag.clone(), rebuild)) {
                return Err(KegError::ValidationError(format!(
                    "formula '{name}' declares bottle '{}' (rebuild {rebuild}) twice",
                    file.tag
                )));
            }
            bottles.push(BottleDescriptor {
                platform_tag: PlatformTag::new(file.tag),
                sha256: file.sha256,
                cellar: file.cellar,
                rebuild,
                url: file.url,
            });
        }

        Ok(Formula {
            name,
            version,
            revision: self.revision,
            desc: self.desc,
            homepage: self.homepage,
            license: self.license,
            url: self.url,
            sha256: self.sha256,
            mirrors: self.mirrors,
            head: self.head,
            dependencies: self.dependencies,
            bottles,
            bottle_root_url: self.bottle.root_url,
            install_steps,
            force_source: self.force_source,
        })
    }

    fn install_steps(
        &self,
        name: &str,
        templates: &HashMap<String, StepTemplate>,
    ) -> Result<Vec<Step>> {
        if !self.steps.is_empty() {
            if self.template.is_some() || !self.step_overrides.is_empty() {
                return Err(KegError::ValidationError(format!(
                    "formula '{name}' mixes explicit steps with a template"
                )));
            }
            let mut steps = self.steps.clone();
            steps.extend(self.extra_steps.iter().cloned());
            return Ok(steps);
        }
        let template_name = self.template.as_deref().unwrap_or(AUTOTOOLS_TEMPLATE);
        let template = match templates.get(template_name) {
            Some(t) => t.clone(),
            None if template_name == AUTOTOOLS_TEMPLATE => StepTemplate::autotools(),
            None => {
                return Err(KegError::ValidationError(format!(
                    "formula '{name}' uses unknown template '{template_name}'"
                )))
            }
        };
        template.instantiate(&self.step_overrides, &self.extra_steps)
    }
}

/// A loaded formula. Immutable; shared as `Arc<Formula>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formula {
    pub name: String,
    pub version: Version,
    pub revision: u32,
    pub desc: Option<String>,
    pub homepage: Option<String>,
    pub license: Option<String>,
    pub url: String,
    pub sha256: String,
    pub mirrors: Vec<String>,
    pub head: Option<HeadSpec>,
    pub dependencies: Vec<Dependency>,
    pub bottles: Vec<BottleDescriptor>,
    pub bottle_root_url: Option<String>,
    pub install_steps: Vec<Step>,
    pub force_source: bool,
}

impl Formula {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Version including the revision suffix, e.g. `1.11.0_1`.
    pub fn version_str_full(&self) -> String {
        if self.revision > 0 {
            format!("{}_{}", self.version, self.revision)
        } else {
            self.version.to_string()
        }
    }

    pub fn has_source(&self) -> bool {
        !self.url.is_empty()
    }

    pub fn runtime_dependencies(&self) -> Vec<&Dependency> {
        self.dependencies.runtime()
    }

    /// Bottles built for `tag`, highest rebuild first.
    pub fn bottles_for(&self, tag: &PlatformTag) -> Vec<&BottleDescriptor> {
        let mut matching: Vec<&BottleDescriptor> =
            self.bottles.iter().filter(|b| &b.platform_tag == tag).collect();
        matching.sort_by(|a, b| b.rebuild.cmp(&a.rebuild));
        matching
    }

    /// Download location of a bottle, derived from the bottle root when the
    /// descriptor carries no explicit url.
    pub fn bottle_url(&self, bottle: &BottleDescriptor) -> Option<String> {
        if let Some(url) = &bottle.url {
            return Some(url.clone());
        }
        let root = self.bottle_root_url.as_deref()?.trim_end_matches('/');
        let rebuild = if bottle.rebuild > 0 {
            format!(".{}", bottle.rebuild)
        } else {
            String::new()
        };
        Some(format!(
            "{root}/{}--{}.{}.bottle{rebuild}.tar.gz",
            self.name,
            self.version_str_full(),
            bottle.platform_tag
        ))
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.version_str_full())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AMQP: &str = r#"{
        "name": "amqp@8.1",
        "version": "1.11.0",
        "desc": "AMQP extension",
        "license": "PHP-3.01",
        "url": "https://pecl.php.net/get/amqp-1.11.0.tgz",
        "sha256": "1aec30e4d6a1a3da30d2b7e9bd0cc2a3c3f8c7de1a1e5a5b0c8d4b1e0f3a2c11",
        "head": {"url": "https://github.com/php-amqp/php-amqp.git"},
        "dependencies": ["rabbitmq-c", {"name": "pkg-config", "tags": ["build"]}],
        "bottle": {
            "root_url": "https://bottles.example.org/keg",
            "rebuild": 1,
            "files": [
                {"tag": "arm64_big_sur", "cellar": ":any", "sha256": "aa"},
                {"tag": "x86_64_linux", "cellar": ":any_skip_relocation", "sha256": "bb"},
                {"tag": "catalina", "cellar": "/usr/local/Cellar", "sha256": "cc", "rebuild": 0}
            ]
        },
        "step_overrides": {
            "configure": {"type": "configure", "args": ["--prefix={prefix}", "--with-librabbitmq-dir={opt:rabbitmq-c}"]}
        },
        "extra_steps": [{"type": "write_file", "path": "ext-amqp.ini", "contents": "extension=amqp.so"}]
    }"#;

    fn load(json: &str) -> Result<Formula> {
        FormulaDescriptor::from_json(json)?.resolve(&HashMap::new())
    }

    #[test]
    fn resolves_descriptor_with_default_template() {
        let formula = load(AMQP).unwrap();
        assert_eq!(formula.name(), "amqp@8.1");
        assert_eq!(formula.version_str_full(), "1.11.0");
        assert_eq!(formula.install_steps.len(), 6);
        assert!(matches!(formula.install_steps[2], Step::Configure { ref args } if args.len() == 2));
        assert_eq!(formula.runtime_dependencies().len(), 1);
        assert_eq!(formula.bottles.len(), 3);
    }

    #[test]
    fn cellar_policies_parse_from_descriptor_strings() {
        let formula = load(AMQP).unwrap();
        let by_tag = |t: &str| {
            formula
                .bottles
                .iter()
                .find(|b| b.platform_tag.as_str() == t)
                .unwrap()
                .clone()
        };
        assert_eq!(by_tag("arm64_big_sur").cellar, CellarPolicy::Any);
        assert_eq!(by_tag("x86_64_linux").cellar, CellarPolicy::AnySkipRelocation);
        assert_eq!(
            by_tag("catalina").cellar,
            CellarPolicy::Path("/usr/local/Cellar".into())
        );
        assert_eq!(by_tag("catalina").rebuild, 0);
        assert_eq!(by_tag("x86_64_linux").rebuild, 1);
    }

    #[test]
    fn derives_bottle_urls_from_root() {
        let formula = load(AMQP).unwrap();
        let linux = &formula.bottles_for(&PlatformTag::new("x86_64_linux"))[0];
        assert_eq!(
            formula.bottle_url(linux).unwrap(),
            "https://bottles.example.org/keg/amqp@8.1--1.11.0.x86_64_linux.bottle.1.tar.gz"
        );
        let catalina = &formula.bottles_for(&PlatformTag::new("catalina"))[0];
        assert!(formula
            .bottle_url(catalina)
            .unwrap()
            .ends_with("catalina.bottle.tar.gz"));
    }

    #[test]
    fn duplicate_bottles_are_rejected() {
        let json = r#"{"name": "x", "version": "1.0", "url": "file:///x.tgz", "sha256": "ab",
            "bottle": {"files": [{"tag": "big_sur", "sha256": "a"}, {"tag": "big_sur", "sha256": "b"}]}}"#;
        assert!(matches!(load(json), Err(KegError::ValidationError(_))));
    }

    #[test]
    fn same_tag_with_different_rebuilds_is_allowed() {
        let json = r#"{"name": "x", "version": "1.0", "url": "file:///x.tgz", "sha256": "ab",
            "bottle": {"files": [{"tag": "big_sur", "sha256": "a"}, {"tag": "big_sur", "sha256": "b", "rebuild": 2}]}}"#;
        let formula = load(json).unwrap();
        assert_eq!(formula.bottles_for(&PlatformTag::new("big_sur"))[0].rebuild, 2);
    }

    #[test]
    fn unknown_template_is_rejected() {
        let json = r#"{"name": "x", "version": "1", "url": "file:///x.tgz", "sha256": "ab",
            "template": "php-extension"}"#;
        assert!(load(json).is_err());
    }

    #[test]
    fn revision_is_part_of_full_version() {
        let json = r#"{"name": "x", "version": "7.0.33", "revision": 2,
            "url": "file:///x.tgz", "sha256": "ab"}"#;
        assert_eq!(load(json).unwrap().version_str_full(), "7.0.33_2");
    }
}
