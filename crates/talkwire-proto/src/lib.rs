pub mod frame;
pub mod types;

pub use frame::{ChannelType, CodecError, Frame};
