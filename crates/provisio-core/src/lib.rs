mod condition;
mod document;
mod environment;
mod error;
mod hash;
mod instruction;
mod path;
mod policy;
mod state;

pub use condition::{ConditionContext, InstructionCondition};
pub use environment::ProvisionEnvironmentInstruction;
pub use error::{ErrorKind, ProvisionError, Result};
pub use hash::ContentHash;
pub use instruction::{
    rolled_back_patch_id, validate_unit_name, ContentAction, ContentItemInstruction,
    ProvisionUnitInstruction, UnitInstructionKind,
};
pub use path::ContentPath;
pub use policy::{UnitUpdatePolicy, UpdatePolicy};
pub use state::{EnvironmentState, ProvisionUnitInfo};
