// keg-common/src/dependency/definition.rs
use std::fmt;

use bitflags::bitflags;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::version::VersionConstraint;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DependencyTag: u8 {
        const RUNTIME     = 0b00000001;
        const BUILD       = 0b00000010;
        const TEST        = 0b00000100;
        const OPTIONAL    = 0b00001000;
        const RECOMMENDED = 0b00010000;
    }
}

impl Default for DependencyTag {
    fn default() -> Self {
        Self::RUNTIME
    }
}

impl DependencyTag {
    /// Parses the tag names used in formula descriptors. Unknown names are
    /// ignored; an empty or build-free tag set implies RUNTIME.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut tags = DependencyTag::empty();
        for name in names {
            match name {
                "runtime" => tags |= DependencyTag::RUNTIME,
                "build" => tags |= DependencyTag::BUILD,
                "test" => tags |= DependencyTag::TEST,
                "optional" => tags |= DependencyTag::OPTIONAL,
                "recommended" => tags |= DependencyTag::RECOMMENDED,
                _ => {}
            }
        }
        if !tags.intersects(
            DependencyTag::BUILD
                | DependencyTag::TEST
                | DependencyTag::OPTIONAL
                | DependencyTag::RECOMMENDED,
        ) {
            tags |= DependencyTag::RUNTIME;
        }
        tags
    }

    /// Needed only while building the dependent.
    pub fn is_build_only(&self) -> bool {
        self.contains(DependencyTag::BUILD)
            && !self.intersects(DependencyTag::RUNTIME | DependencyTag::RECOMMENDED)
    }
}

impl fmt::Display for DependencyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    pub name: String,
    pub tags: DependencyTag,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraint: Option<VersionConstraint>,
}

impl Dependency {
    pub fn new_runtime(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: DependencyTag::RUNTIME,
            constraint: None,
        }
    }

    pub fn new_with_tags(name: impl Into<String>, tags: DependencyTag) -> Self {
        Self {
            name: name.into(),
            tags,
            constraint: None,
        }
    }

    pub fn with_constraint(mut self, constraint: VersionConstraint) -> Self {
        self.constraint = Some(constraint);
        self
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.constraint {
            Some(c) => write!(f, "{} ({})", self.name, c),
            None => f.write_str(&self.name),
        }
    }
}

// Descriptors list dependencies either as plain names (runtime) or as
// `{"name": .., "tags": [..], "version": ..}` objects.
impl<'de> Deserialize<'de> for Dependency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(name) => Ok(Dependency::new_runtime(name)),
            Value::Object(map) => {
                let name = map
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| de::Error::missing_field("name"))?
                    .to_string();
                let tags = match map.get("tags") {
                    Some(Value::Array(values)) => {
                        DependencyTag::from_names(values.iter().filter_map(Value::as_str))
                    }
                    Some(Value::String(single)) => DependencyTag::from_names([single.as_str()]),
                    Some(_) => return Err(de::Error::custom("dependency tags must be a list")),
                    None => DependencyTag::RUNTIME,
                };
                let constraint = match map.get("version").and_then(Value::as_str) {
                    Some(raw) => Some(VersionConstraint::parse(raw).map_err(de::Error::custom)?),
                    None => None,
                };
                Ok(Dependency {
                    name,
                    tags,
                    constraint,
                })
            }
            other => Err(de::Error::custom(format!(
                "expected dependency name or object, got {other}"
            ))),
        }
    }
}

pub trait DependencyExt {
    fn filter_by_tags(&self, include: DependencyTag, exclude: DependencyTag) -> Vec<&Dependency>;
    fn runtime(&self) -> Vec<&Dependency>;
    fn build_time(&self) -> Vec<&Dependency>;
}

impl DependencyExt for Vec<Dependency> {
    fn filter_by_tags(&self, include: DependencyTag, exclude: DependencyTag) -> Vec<&Dependency> {
        self.iter()
            .filter(|dep| dep.tags.contains(include) && !dep.tags.intersects(exclude))
            .collect()
    }

    fn runtime(&self) -> Vec<&Dependency> {
        self.iter()
            .filter(|dep| {
                dep.tags.intersects(
                    DependencyTag::RUNTIME | DependencyTag::RECOMMENDED | DependencyTag::OPTIONAL,
                )
            })
            .collect()
    }

    fn build_time(&self) -> Vec<&Dependency> {
        self.filter_by_tags(DependencyTag::BUILD, DependencyTag::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_names_are_runtime_dependencies() {
        let deps: Vec<Dependency> = serde_json::from_str(r#"["rabbitmq-c", "php@8.1"]"#).unwrap();
        assert_eq!(deps[0], Dependency::new_runtime("rabbitmq-c"));
        assert_eq!(deps[1].tags, DependencyTag::RUNTIME);
    }

    #[test]
    fn object_form_carries_tags_and_constraint() {
        let deps: Vec<Dependency> = serde_json::from_str(
            r#"[{"name": "pkg-config", "tags": ["build"], "version": ">=0.29"},
                {"name": "krb5", "tags": ["optional"]}]"#,
        )
        .unwrap();
        assert!(deps[0].tags.is_build_only());
        assert_eq!(deps[0].constraint.as_ref().map(|c| c.as_str()), Some(">=0.29"));
        assert!(deps[1].tags.contains(DependencyTag::OPTIONAL));
        assert!(!deps[1].tags.contains(DependencyTag::RUNTIME));
    }

    #[test]
    fn runtime_filter_excludes_build_only() {
        let deps = vec![
            Dependency::new_runtime("openssl@3"),
            Dependency::new_with_tags("autoconf", DependencyTag::BUILD),
            Dependency::new_with_tags("libxml2", DependencyTag::BUILD | DependencyTag::RUNTIME),
        ];
        let runtime: Vec<&str> = deps.runtime().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(runtime, vec!["openssl@3", "libxml2"]);
        assert_eq!(deps.build_time().len(), 2);
    }
}
