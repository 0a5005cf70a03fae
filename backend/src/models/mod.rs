//! Data models shared across the stores and the session services.

pub mod account;
pub mod login_attempt;
pub mod session;

pub use account::*;
pub use login_attempt::*;
pub use session::*;
