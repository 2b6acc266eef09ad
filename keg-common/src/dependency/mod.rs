// keg-common/src/dependency/mod.rs
pub mod definition;
pub mod resolver;

pub use definition::{Dependency, DependencyExt, DependencyTag};
pub use resolver::{
    BuildPlan, DependencyResolver, NodeInstallStrategy, PerTargetInstallPreferences, PlanNode,
    ResolutionContext,
};
