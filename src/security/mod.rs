pub mod approval;
pub mod capabilities;

pub use approval::{
    ApprovalGate, ApprovalRecord, ApprovalState, ApprovalStore, JsonApprovalStore,
    MemoryApprovalStore, hash_body,
};
pub use capabilities::{CallerContext, Capability, PrivilegeCheck, require};
