pub mod access;
pub mod tier;

pub use access::{
    normalize_path, AccessError, AccessMode, AccessRoots, AccessValidator, DenialReason,
    DEFAULT_DENY_ROOTS,
};
pub use tier::{Tier, TierDecision, TierPolicy};
