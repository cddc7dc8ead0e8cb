//! Granular access control: the bundle lifecycle state machine, rule
//! evaluation, and per-viewer censorship of outgoing changes.

pub(crate) mod censor;
mod engine;
mod error;
pub(crate) mod filters;
pub(crate) mod permission_info;
pub mod permissions;
pub(crate) mod rules;
pub(crate) mod steps;
pub mod test_utils;
pub(crate) mod user;

pub use engine::{AccessOptions, GranularAccess};
pub use error::AccessError;
pub use filters::{AccessCheck, Severity};
pub use permission_info::{PermissionInfo, Ruler};
pub use rules::{CompiledFormula, EvalContext, RuleCollection, RuleCompiler};
pub use steps::{ActionStep, MetaSnapshot, StepBuilder};
pub use user::{HomeDb, UserInfo, UserOverride, UserProfile, UserResolver};
