pub mod manager;
pub mod mirror;

pub use manager::{
    DeviceInfo, PresenceConfig, PresenceError, PresenceManager, PresenceSnapshot, PresenceState,
    PresenceUpdate, UserStatus,
};
pub use mirror::{HttpStatusMirror, StatusMirror};
