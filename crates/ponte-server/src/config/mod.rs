// crates/ponte-server/src/config/mod.rs
// Configuration modules

mod env;

pub use env::{ConfigValidation, EnvConfig};
