// keg-core/src/install/bottle/mod.rs
pub mod exec;
pub mod link;
pub mod select;

pub use exec::pour_bottle;
pub use link::link_keg;
pub use select::{best_bottle, select_artifact};
