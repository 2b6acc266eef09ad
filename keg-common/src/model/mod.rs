// keg-common/src/model/mod.rs
pub mod formula;
pub mod platform;
pub mod step;
pub mod version;

pub use formula::{BottleDescriptor, CellarPolicy, Formula, FormulaDescriptor, HeadSpec};
pub use platform::PlatformTag;
pub use step::{Step, StepTemplate};
pub use version::VersionConstraint;
