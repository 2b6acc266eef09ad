// keg-common/src/dependency/resolver.rs

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use semver::Version;
use tracing::{debug, error};

use crate::dependency::{Dependency, DependencyTag};
use crate::error::{KegError, Result};
use crate::formulary::{Formulary, InstallTarget};
use crate::model::formula::Formula;
use crate::model::version::VersionConstraint;
use crate::state::InstallStateStore;

// --- NodeInstallStrategy ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeInstallStrategy {
    BottlePreferred,
    SourceOnly,
}

// --- PerTargetInstallPreferences ---
#[derive(Debug, Clone, Default)]
pub struct PerTargetInstallPreferences {
    pub force_source_build_targets: HashSet<String>,
    pub head_targets: HashSet<String>,
}

// --- ResolutionContext ---
pub struct ResolutionContext<'a> {
    pub formulary: &'a Formulary,
    pub state: &'a InstallStateStore,
    pub include_optional: bool,
    pub include_test: bool,
    pub skip_recommended: bool,
    pub initial_target_preferences: &'a PerTargetInstallPreferences,
    pub build_all_from_source: bool,
    /// Whether a usable bottle exists for the host platform.
    pub has_bottle_for_current_platform: &'a dyn Fn(&Formula) -> bool,
}

/// One formula that has to be installed.
#[derive(Debug, Clone)]
pub struct PlanNode {
    pub formula: Arc<Formula>,
    pub strategy: NodeInstallStrategy,
    /// Named on the command line rather than pulled in as a dependency.
    pub requested: bool,
    /// Reached only through build-dependency edges.
    pub build_only: bool,
    pub head: bool,
    /// Every dependency this formula was resolved against, installed or planned.
    pub dependencies: Vec<String>,
    /// Subset of `dependencies` needed at runtime.
    pub runtime_dependencies: Vec<String>,
}

impl PlanNode {
    pub fn name(&self) -> &str {
        self.formula.name()
    }
}

/// Formulae to install, ordered so that every node follows its dependencies.
#[derive(Debug, Clone, Default)]
pub struct BuildPlan {
    pub nodes: Vec<PlanNode>,
    /// Requested formulae that are already installed at the resolved version.
    pub already_satisfied: Vec<String>,
}

impl BuildPlan {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.nodes.iter().map(PlanNode::name).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Visited,
}

pub struct DependencyResolver<'a> {
    context: ResolutionContext<'a>,
    marks: HashMap<String, Mark>,
    /// Names currently on the DFS stack, outermost first.
    path: Vec<String>,
    nodes: HashMap<String, PlanNode>,
    order: Vec<String>,
    /// Dependencies satisfied by an existing install, with the installed version.
    installed: HashMap<String, String>,
    already_satisfied: Vec<String>,
    /// Every constraint any edge has placed on a name so far.
    constraints: HashMap<String, Vec<VersionConstraint>>,
    /// Names reached through at least one non-build edge or named as a target.
    runtime_required: HashSet<String>,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(context: ResolutionContext<'a>) -> Self {
        Self {
            context,
            marks: HashMap::new(),
            path: Vec::new(),
            nodes: HashMap::new(),
            order: Vec::new(),
            installed: HashMap::new(),
            already_satisfied: Vec::new(),
            constraints: HashMap::new(),
            runtime_required: HashSet::new(),
        }
    }

    fn determine_node_install_strategy(
        &self,
        formula: &Formula,
        is_initial_target: bool,
    ) -> NodeInstallStrategy {
        let name = formula.name();
        if is_initial_target {
            let prefs = self.context.initial_target_preferences;
            if prefs.force_source_build_targets.contains(name) || prefs.head_targets.contains(name)
            {
                return NodeInstallStrategy::SourceOnly;
            }
        }
        if self.context.build_all_from_source || formula.force_source {
            return NodeInstallStrategy::SourceOnly;
        }
        let bottle_available = (self.context.has_bottle_for_current_platform)(formula);
        let strategy = if bottle_available {
            NodeInstallStrategy::BottlePreferred
        } else {
            NodeInstallStrategy::SourceOnly
        };
        debug!(
            "Install strategy for '{name}': {:?} (initial_target={is_initial_target}, bottle_available={bottle_available})",
            strategy
        );
        strategy
    }

    /// Resolves `targets` and their dependency closure into a build plan.
    /// Any failure aborts resolution; no partial plan is returned.
    pub fn resolve_targets(mut self, targets: &[InstallTarget]) -> Result<BuildPlan> {
        debug!("Starting dependency resolution for targets: {:?}", targets);
        for target in targets {
            self.resolve_recursive(
                &target.name,
                target.constraint.as_ref(),
                DependencyTag::RUNTIME,
                true,
            )?;
        }

        let order = self.topological_order()?;
        let mut nodes = Vec::with_capacity(order.len());
        for name in &order {
            if let Some(node) = self.nodes.remove(name) {
                nodes.push(node);
            }
        }
        debug!(
            "Final installation plan: {:?}",
            nodes.iter().map(PlanNode::name).collect::<Vec<_>>()
        );
        Ok(BuildPlan {
            nodes,
            already_satisfied: self.already_satisfied,
        })
    }

    /// Post-order walk from the requested nodes. Nodes left unreachable by a
    /// re-selection are dropped here.
    fn topological_order(&self) -> Result<Vec<String>> {
        let mut marks = HashMap::new();
        let mut stack = Vec::new();
        let mut out = Vec::with_capacity(self.nodes.len());
        for name in &self.order {
            if self.nodes.get(name).is_some_and(|n| n.requested) {
                self.emit(name, &mut marks, &mut stack, &mut out)?;
            }
        }
        Ok(out)
    }

    fn emit(
        &self,
        name: &str,
        marks: &mut HashMap<String, Mark>,
        stack: &mut Vec<String>,
        out: &mut Vec<String>,
    ) -> Result<()> {
        match marks.get(name) {
            Some(Mark::Visited) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|n| n == name).unwrap_or(0);
                let mut chain: Vec<String> = stack[start..].to_vec();
                chain.push(name.to_string());
                error!("Dependency cycle detected: {}", chain.join(" -> "));
                return Err(KegError::CircularDependency { chain });
            }
            None => {}
        }
        let Some(node) = self.nodes.get(name) else {
            return Ok(());
        };
        marks.insert(name.to_string(), Mark::Visiting);
        stack.push(name.to_string());
        for dep in &node.dependencies {
            self.emit(dep, marks, stack, out)?;
        }
        stack.pop();
        marks.insert(name.to_string(), Mark::Visited);
        out.push(name.to_string());
        Ok(())
    }

    fn resolve_recursive(
        &mut self,
        name: &str,
        constraint: Option<&VersionConstraint>,
        tags_from_parent_edge: DependencyTag,
        is_initial_target: bool,
    ) -> Result<()> {
        debug!(
            "Resolving: {} (requested as {:?}, is_target: {})",
            name, tags_from_parent_edge, is_initial_target
        );
        if let Some(c) = constraint {
            let seen = self.constraints.entry(name.to_string()).or_default();
            if !seen.contains(c) {
                seen.push(c.clone());
            }
        }
        if is_initial_target || !tags_from_parent_edge.is_build_only() {
            self.runtime_required.insert(name.to_string());
        }

        match self.marks.get(name) {
            Some(Mark::Visiting) => {
                let start = self.path.iter().position(|n| n == name).unwrap_or(0);
                let mut chain: Vec<String> = self.path[start..].to_vec();
                chain.push(name.to_string());
                error!("Dependency cycle detected: {}", chain.join(" -> "));
                return Err(KegError::CircularDependency { chain });
            }
            Some(Mark::Visited) => return self.revisit(name, constraint, tags_from_parent_edge, is_initial_target),
            None => {}
        }

        let head_requested =
            is_initial_target && self.context.initial_target_preferences.head_targets.contains(name);

        if !is_initial_target {
            if let Some(version) = self.installed_satisfying(name) {
                debug!("'{}' already installed at {}, skipping", name, version);
                self.marks.insert(name.to_string(), Mark::Visited);
                self.installed.insert(name.to_string(), version);
                return Ok(());
            }
        }

        let formula = self.lookup_formula(name)?;

        if is_initial_target && !head_requested {
            let version = formula.version_str_full();
            if self.context.state.get(name, &version).is_some() {
                debug!("Requested '{}' {} is already installed", name, version);
                self.marks.insert(name.to_string(), Mark::Visited);
                self.installed.insert(name.to_string(), version);
                self.already_satisfied.push(name.to_string());
                return Ok(());
            }
        }

        let strategy = self.determine_node_install_strategy(&formula, is_initial_target);

        self.marks.insert(name.to_string(), Mark::Visiting);
        self.path.push(name.to_string());

        let mut dependencies = Vec::new();
        let mut runtime_dependencies = Vec::new();
        for dep in &formula.dependencies {
            if !self.context.should_process_dependency_edge(&formula, dep, strategy) {
                continue;
            }
            self.resolve_recursive(&dep.name, dep.constraint.as_ref(), dep.tags, false)?;
            dependencies.push(dep.name.clone());
            if !dep.tags.is_build_only() {
                runtime_dependencies.push(dep.name.clone());
            }
        }

        self.path.pop();
        self.marks.insert(name.to_string(), Mark::Visited);
        self.order.push(name.to_string());
        self.nodes.insert(
            name.to_string(),
            PlanNode {
                formula,
                strategy,
                requested: is_initial_target,
                build_only: !self.runtime_required.contains(name),
                head: head_requested,
                dependencies,
                runtime_dependencies,
            },
        );
        debug!("Finished resolving '{}'", name);
        Ok(())
    }

    fn satisfies_all(&self, name: &str, version: &Version) -> bool {
        self.constraints
            .get(name)
            .is_none_or(|cs| cs.iter().all(|c| c.matches(version)))
    }

    /// Highest installed version of `name` satisfying every constraint seen so far.
    fn installed_satisfying(&self, name: &str) -> Option<String> {
        let constraints = self.constraints.get(name).map(Vec::as_slice).unwrap_or_default();
        self.context
            .state
            .versions(name)
            .into_iter()
            .filter(|r| constraints.iter().all(|c| r.satisfies(Some(c))))
            .max_by_key(|r| (r.semver(), r.installed_at))
            .map(|r| r.version)
    }

    /// Highest available version of `name` satisfying every constraint seen so far.
    fn lookup_formula(&self, name: &str) -> Result<Arc<Formula>> {
        self.context
            .formulary
            .versions(name)
            .iter()
            .rev()
            .find(|f| self.satisfies_all(name, &f.version))
            .cloned()
            .ok_or_else(|| {
                let constraint = self.constraints.get(name).map(|cs| {
                    cs.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
                });
                KegError::UnknownFormula {
                    name: name.to_string(),
                    constraint,
                    required_by: self.path.clone(),
                }
            })
    }

    /// A node reached again through another edge. When the new edge's
    /// constraint rules out what was chosen earlier, another version that
    /// satisfies every edge is selected instead.
    fn revisit(
        &mut self,
        name: &str,
        constraint: Option<&VersionConstraint>,
        tags_from_parent_edge: DependencyTag,
        is_initial_target: bool,
    ) -> Result<()> {
        if let Some(node) = self.nodes.get_mut(name) {
            if let Some(c) = constraint {
                if !c.matches(&node.formula.version) {
                    let selected = node.formula.version_str_full();
                    if self.lookup_formula(name).is_err() {
                        return Err(KegError::DependencyError(format!(
                            "'{name}' is required as {c} but {selected} was already selected"
                        )));
                    }
                    debug!("'{}' {} does not satisfy {}; selecting again", name, selected, c);
                    return self.reselect(name, is_initial_target);
                }
            }
            node.requested |= is_initial_target;
            if is_initial_target || !tags_from_parent_edge.is_build_only() {
                node.build_only = false;
            }
            return Ok(());
        }
        if let Some(version) = self.installed.get(name).cloned() {
            let satisfied = self
                .context
                .state
                .get(name, &version)
                .is_some_and(|r| r.satisfies(constraint));
            if !satisfied {
                if self.installed_satisfying(name).is_none() && self.lookup_formula(name).is_err() {
                    return Err(KegError::DependencyError(format!(
                        "'{name}' is installed at {version} which does not satisfy {}",
                        constraint.map(|c| c.to_string()).unwrap_or_default()
                    )));
                }
                debug!("Installed '{}' {} is too old for a later edge; selecting again", name, version);
                return self.reselect(name, is_initial_target);
            }
            if is_initial_target && !self.already_satisfied.iter().any(|n| n == name) {
                self.already_satisfied.push(name.to_string());
            }
        }
        Ok(())
    }

    /// Forgets the earlier choice for `name` and resolves it again against
    /// every constraint recorded for it.
    fn reselect(&mut self, name: &str, is_initial_target: bool) -> Result<()> {
        let previous = self.nodes.remove(name);
        self.order.retain(|n| n != name);
        self.installed.remove(name);
        self.marks.remove(name);
        let was_satisfied_target = self.already_satisfied.iter().any(|n| n == name);
        self.already_satisfied.retain(|n| n != name);

        let requested = is_initial_target
            || was_satisfied_target
            || previous.as_ref().is_some_and(|p| p.requested);
        let tags = if self.runtime_required.contains(name) {
            DependencyTag::RUNTIME
        } else {
            DependencyTag::BUILD
        };
        self.resolve_recursive(name, None, tags, requested)
    }
}

// --- ResolutionContext methods ---
impl ResolutionContext<'_> {
    pub fn should_consider_edge_globally(&self, edge_tags: DependencyTag) -> bool {
        if edge_tags.contains(DependencyTag::TEST) && !self.include_test {
            return false;
        }
        if edge_tags.contains(DependencyTag::OPTIONAL) && !self.include_optional {
            return false;
        }
        if edge_tags.contains(DependencyTag::RECOMMENDED) && self.skip_recommended {
            return false;
        }
        true
    }

    /// Pure build dependencies of a formula poured from a bottle are not needed.
    pub fn should_process_dependency_edge(
        &self,
        parent: &Formula,
        edge: &Dependency,
        parent_strategy: NodeInstallStrategy,
    ) -> bool {
        if !self.should_consider_edge_globally(edge.tags) {
            debug!(
                "Edge {} -> {} with tags {:?} skipped globally",
                parent.name(),
                edge.name,
                edge.tags
            );
            return false;
        }
        if parent_strategy == NodeInstallStrategy::BottlePreferred && edge.tags.is_build_only() {
            debug!(
                "Edge {} -> {} SKIPPED: pure build dependency of a bottled parent",
                parent.name(),
                edge.name
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::Utc;

    use super::*;
    use crate::model::formula::FormulaDescriptor;
    use crate::state::{InstallKind, InstallRecord};

    fn formula(name: &str, deps: &[(&str, &[&str])], bottled: bool) -> Formula {
        let deps_json: Vec<String> = deps
            .iter()
            .map(|(n, tags)| {
                let tags: Vec<String> = tags.iter().map(|t| format!("\"{t}\"")).collect();
                format!(r#"{{"name": "{n}", "tags": [{}]}}"#, tags.join(","))
            })
            .collect();
        let bottle = if bottled {
            r#", "bottle": {"files": [{"tag": "x86_64_linux", "sha256": "00"}]}"#
        } else {
            ""
        };
        let json = format!(
            r#"{{"name": "{name}", "version": "1.0", "url": "file:///{name}.tgz", "sha256": "00",
                "dependencies": [{}]{bottle}}}"#,
            deps_json.join(",")
        );
        FormulaDescriptor::from_json(&json)
            .unwrap()
            .resolve(&HashMap::new())
            .unwrap()
    }

    /// Source formula at `version` whose dependencies carry version constraints
    /// (an empty constraint means any version).
    fn versioned(name: &str, version: &str, deps: &[(&str, &str)]) -> Formula {
        let deps_json: Vec<String> = deps
            .iter()
            .map(|(n, c)| match *c {
                "" => format!(r#""{n}""#),
                c => format!(r#"{{"name": "{n}", "version": "{c}"}}"#),
            })
            .collect();
        let json = format!(
            r#"{{"name": "{name}", "version": "{version}", "url": "file:///{name}-{version}.tgz",
                "sha256": "00", "dependencies": [{}]}}"#,
            deps_json.join(",")
        );
        FormulaDescriptor::from_json(&json)
            .unwrap()
            .resolve(&HashMap::new())
            .unwrap()
    }

    fn record(name: &str, version: &str) -> InstallRecord {
        InstallRecord {
            name: name.into(),
            version: version.into(),
            keg_path: format!("/k/{name}/{version}").into(),
            manifest: BTreeSet::new(),
            installed_at: Utc::now(),
            install_kind: InstallKind::Source,
            installed_on_request: true,
            runtime_dependencies: vec![],
        }
    }

    fn has_bottle(f: &Formula) -> bool {
        !f.bottles.is_empty()
    }

    struct Fixture {
        formulary: Formulary,
        state: InstallStateStore,
        prefs: PerTargetInstallPreferences,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(formulae: Vec<Formula>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let state = InstallStateStore::open(dir.path().join("state.json")).unwrap();
            Self {
                formulary: Formulary::from_formulae(formulae),
                state,
                prefs: PerTargetInstallPreferences::default(),
                _dir: dir,
            }
        }

        fn resolve_with(&self, targets: &[&str], include_optional: bool) -> Result<BuildPlan> {
            let context = ResolutionContext {
                formulary: &self.formulary,
                state: &self.state,
                include_optional,
                include_test: false,
                skip_recommended: false,
                initial_target_preferences: &self.prefs,
                build_all_from_source: false,
                has_bottle_for_current_platform: &has_bottle,
            };
            let targets: Vec<InstallTarget> = targets
                .iter()
                .map(|t| InstallTarget {
                    name: t.to_string(),
                    constraint: None,
                })
                .collect();
            DependencyResolver::new(context).resolve_targets(&targets)
        }

        fn resolve(&self, targets: &[&str]) -> Result<BuildPlan> {
            self.resolve_with(targets, false)
        }
    }

    fn assert_topological(plan: &BuildPlan) {
        for (idx, node) in plan.nodes.iter().enumerate() {
            for dep in &node.dependencies {
                if let Some(dep_idx) = plan.position(dep) {
                    assert!(dep_idx < idx, "{dep} must precede {}", node.name());
                }
            }
        }
    }

    #[test]
    fn diamond_resolves_in_dependency_order() {
        let fx = Fixture::new(vec![
            formula("a", &[("b", &[]), ("c", &[])], false),
            formula("b", &[("d", &[])], false),
            formula("c", &[("d", &[])], false),
            formula("d", &[], false),
        ]);
        let plan = fx.resolve(&["a"]).unwrap();
        assert_eq!(plan.len(), 4);
        assert_eq!(plan.nodes[0].name(), "d");
        assert_eq!(plan.nodes[3].name(), "a");
        assert!(plan.get("a").unwrap().requested);
        assert!(!plan.get("d").unwrap().requested);
        assert_topological(&plan);
    }

    #[test]
    fn every_acyclic_chain_and_fan_is_ordered() {
        // Layered graph: node i depends on every node j < i with j % 3 == i % 2.
        let names: Vec<String> = (0..12).map(|i| format!("f{i}")).collect();
        let mut formulae = Vec::new();
        for i in 0..12 {
            let deps: Vec<(&str, &[&str])> = (0..i)
                .filter(|j| j % 3 == i % 2)
                .map(|j| (names[j].as_str(), &[][..]))
                .collect();
            formulae.push(formula(&names[i], &deps, false));
        }
        let fx = Fixture::new(formulae);
        let all: Vec<&str> = names.iter().map(String::as_str).rev().collect();
        let plan = fx.resolve(&all).unwrap();
        assert_eq!(plan.len(), 12);
        assert_topological(&plan);
    }

    #[test]
    fn cycle_is_rejected_with_full_chain() {
        let fx = Fixture::new(vec![
            formula("a", &[("b", &[])], false),
            formula("b", &[("c", &[])], false),
            formula("c", &[("a", &[])], false),
        ]);
        match fx.resolve(&["a"]) {
            Err(KegError::CircularDependency { chain }) => {
                assert_eq!(chain, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let fx = Fixture::new(vec![formula("a", &[("a", &[])], false)]);
        assert!(matches!(
            fx.resolve(&["a"]),
            Err(KegError::CircularDependency { .. })
        ));
    }

    #[test]
    fn unknown_dependency_names_the_requesting_chain() {
        let fx = Fixture::new(vec![
            formula("a", &[("b", &[])], false),
            formula("b", &[("ghost", &[])], false),
        ]);
        match fx.resolve(&["a"]) {
            Err(KegError::UnknownFormula {
                name, required_by, ..
            }) => {
                assert_eq!(name, "ghost");
                assert_eq!(required_by, vec!["a", "b"]);
            }
            other => panic!("expected unknown formula, got {other:?}"),
        }
    }

    #[test]
    fn optional_dependencies_need_opt_in() {
        let fx = Fixture::new(vec![
            formula("a", &[("krb5", &["optional"])], false),
            formula("krb5", &[], false),
        ]);
        assert_eq!(fx.resolve(&["a"]).unwrap().names(), vec!["a"]);
        assert_eq!(fx.resolve_with(&["a"], true).unwrap().names(), vec!["krb5", "a"]);
    }

    #[test]
    fn build_dependencies_are_marked_and_skipped_for_bottles() {
        let fx = Fixture::new(vec![
            formula("src", &[("pkg-config", &["build"]), ("lib", &[])], false),
            formula("bottled", &[("pkg-config", &["build"]), ("lib", &[])], true),
            formula("pkg-config", &[], false),
            formula("lib", &[], false),
        ]);
        let plan = fx.resolve(&["src"]).unwrap();
        assert!(plan.get("pkg-config").unwrap().build_only);
        assert!(!plan.get("lib").unwrap().build_only);
        assert_eq!(plan.get("src").unwrap().runtime_dependencies, vec!["lib"]);

        let plan = fx.resolve(&["bottled"]).unwrap();
        assert!(plan.get("pkg-config").is_none());
        assert_eq!(plan.get("bottled").unwrap().strategy, NodeInstallStrategy::BottlePreferred);
    }

    #[test]
    fn installed_dependencies_and_roots_are_not_planned() {
        let fx = Fixture::new(vec![
            formula("a", &[("b", &[])], false),
            formula("b", &[], false),
        ]);
        fx.state.record(record("b", "1.0.0")).unwrap();
        let plan = fx.resolve(&["a"]).unwrap();
        assert_eq!(plan.names(), vec!["a"]);
        assert_eq!(plan.get("a").unwrap().dependencies, vec!["b"]);

        fx.state.record(record("a", "1.0.0")).unwrap();
        let plan = fx.resolve(&["a"]).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.already_satisfied, vec!["a"]);
    }

    #[test]
    fn forced_source_targets_keep_their_build_dependencies() {
        let mut fx = Fixture::new(vec![
            formula("bottled", &[("pkg-config", &["build"])], true),
            formula("pkg-config", &[], false),
        ]);
        fx.prefs.force_source_build_targets.insert("bottled".into());
        let plan = fx.resolve(&["bottled"]).unwrap();
        assert_eq!(plan.names(), vec!["pkg-config", "bottled"]);
        assert_eq!(plan.get("bottled").unwrap().strategy, NodeInstallStrategy::SourceOnly);
    }

    fn shared_dependency_fixture(first: &str, second: &str, d_versions: &[(&str, &[(&str, &str)])]) -> Fixture {
        let mut formulae = vec![
            versioned("a", "1.0", &[(first, ""), (second, "")]),
            versioned("b", "1.0", &[("d", "")]),
            versioned("c", "1.0", &[("d", ">=2")]),
            versioned("e", "1.0", &[]),
        ];
        for (version, deps) in d_versions {
            formulae.push(versioned("d", version, deps));
        }
        Fixture::new(formulae)
    }

    #[test]
    fn installed_dependency_too_old_for_a_later_edge_is_upgraded_in_either_order() {
        for (first, second) in [("b", "c"), ("c", "b")] {
            let fx = shared_dependency_fixture(first, second, &[("1.0", &[]), ("2.0", &[])]);
            fx.state.record(record("d", "1.0.0")).unwrap();

            let plan = fx.resolve(&["a"]).unwrap_or_else(|e| panic!("a -> [{first}, {second}]: {e}"));
            assert_eq!(plan.len(), 4, "a -> [{first}, {second}]: {:?}", plan.names());
            assert_eq!(plan.get("d").unwrap().formula.version_str_full(), "2.0.0");
            assert!(!plan.get("d").unwrap().build_only);
            assert_eq!(plan.names().last(), Some(&"a"));
            assert_topological(&plan);
        }
    }

    #[test]
    fn planned_dependency_is_reselected_for_a_stricter_edge_in_either_order() {
        // d 3.0 is the unconstrained pick but c only accepts 2.x; its e
        // dependency must not survive the re-selection.
        for (first, second) in [("b", "c"), ("c", "b")] {
            let fx = Fixture::new(vec![
                versioned("a", "1.0", &[(first, ""), (second, "")]),
                versioned("b", "1.0", &[("d", "")]),
                versioned("c", "1.0", &[("d", "<3")]),
                versioned("d", "2.0", &[]),
                versioned("d", "3.0", &[("e", "")]),
                versioned("e", "1.0", &[]),
            ]);

            let plan = fx.resolve(&["a"]).unwrap();
            assert_eq!(plan.get("d").unwrap().formula.version_str_full(), "2.0.0");
            assert!(plan.get("e").is_none(), "{:?}", plan.names());
            assert_eq!(plan.len(), 4);
            assert_topological(&plan);
        }
    }

    #[test]
    fn incompatible_constraints_fail_in_either_order() {
        for (first, second) in [("b", "c"), ("c", "b")] {
            let fx = Fixture::new(vec![
                versioned("a", "1.0", &[(first, ""), (second, "")]),
                versioned("b", "1.0", &[("d", "<2")]),
                versioned("c", "1.0", &[("d", ">=2")]),
                versioned("d", "1.0", &[]),
                versioned("d", "2.0", &[]),
            ]);
            assert!(
                matches!(fx.resolve(&["a"]), Err(KegError::DependencyError(_))),
                "a -> [{first}, {second}]"
            );
        }
    }

    #[test]
    fn reselection_that_closes_a_loop_is_a_cycle() {
        // d 2.0 depends on b, which already depends on d.
        let fx = shared_dependency_fixture("b", "c", &[("1.0", &[]), ("2.0", &[("b", "")])]);
        fx.state.record(record("d", "1.0.0")).unwrap();
        assert!(matches!(
            fx.resolve(&["a"]),
            Err(KegError::CircularDependency { .. })
        ));
    }
}
