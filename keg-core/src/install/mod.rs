// keg-core/src/install/mod.rs
pub mod bottle;
