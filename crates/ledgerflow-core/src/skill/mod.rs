//! Skill invocation surface.
//!
//! The [`Skill`] trait, the context passed to every invocation and the
//! registry the engine resolves `skill_id`s against.

pub mod executor;
pub mod registry;

pub use executor::{FnSkill, Skill, SkillContext, SkillError};
pub use registry::{SkillDyn, SkillRegistry, execute_with_timeout};
