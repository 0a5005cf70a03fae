pub mod login_attempt;
pub mod memory;
pub mod session;
pub mod transaction;

pub use login_attempt::{AttemptLedger, PgAttemptLedger};
pub use memory::{MemoryAttemptLedger, MemorySessionStore};
pub use session::{
    CreateOutcome, LimitOutcome, PgSessionStore, RotationOutcome, SessionLimit, SessionStore,
};
