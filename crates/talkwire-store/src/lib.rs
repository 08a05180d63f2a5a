pub mod client;
pub mod error;
pub mod group;
pub mod keys;

pub use client::{Store, StoreMessage};
pub use error::StoreError;
pub use group::{GroupDirectory, JanitorConfig, SpeakerTurn};
