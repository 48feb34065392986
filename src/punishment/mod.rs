//! Timed punishment core: records, persistence, expiration scheduling,
//! and the lifecycle manager that ties them to a platform.
//!
//! Layering is strict: `record` and `duration` are pure data, `store`
//! persists, `scheduler` only tracks deadlines, and `manager` is the
//! sole writer that coordinates all of them through the [`Platform`]
//! and [`ModLog`] seams.

pub mod duration;
pub mod error;
pub mod manager;
pub mod outcome;
pub mod platform;
pub mod record;
pub mod scheduler;
pub mod store;

pub use duration::{parse_duration, render_duration};
pub use error::{ModLogError, PlatformError, PunishError, PunishResult};
pub use manager::{CASE_MIN_SECONDS, PunishmentManager};
pub use outcome::PunishOutcome;
pub use platform::{MemberInfo, ModLog, Platform};
pub use record::{PunishKey, PunishmentRecord};
pub use scheduler::{ExpirationScheduler, NEAR_HORIZON, PROMOTE_INTERVAL};
pub use store::PunishmentStore;
