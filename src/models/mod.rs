pub mod attempt;
pub mod form;
pub mod profile;

pub use attempt::{AttemptContext, AttemptState, BlockReason, Outcome};
pub use form::{FormSpec, FormSubmission};
pub use profile::{SeedRecord, UsedRecoveryCode, UserSummary, UserTfaSettings};
