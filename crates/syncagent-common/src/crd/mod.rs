//! Custom resource types: the shared status condition and the `Thing` example resource

mod thing;
mod types;

pub use thing::{Thing, ThingSpec, ThingStatus};
pub use types::{set_condition, Condition, ConditionStatus};
