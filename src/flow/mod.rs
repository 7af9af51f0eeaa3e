pub mod fallback;
pub mod process;

pub use fallback::FallbackResolver;
pub use process::{
    BeginOutcome, FloodControl, IdentityStore, PermissiveFloodControl, SessionGate, TfaProcess,
};
