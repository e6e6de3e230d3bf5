pub mod config;
pub mod entity;
pub mod error;
pub mod ruleset;

pub use config::Config;
pub use entity::*;
pub use error::*;
pub use ruleset::{resolve_ruleset, Ruleset, RulesetContext};
