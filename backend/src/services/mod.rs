pub mod auth;
pub mod credentials;
pub mod login_guard;
pub mod maintenance;
pub mod session;

pub use auth::{AuthService, AuthTokens};
pub use credentials::{CredentialError, CredentialVerifier};
pub use login_guard::LoginGuard;
pub use maintenance::{MaintenanceWorker, SweepReport};
pub use session::SessionEngine;
