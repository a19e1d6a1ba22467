pub mod id;
pub mod replay;

pub use id::ChannelId;
pub use replay::{AggregateState, AnchorPoint, SeekOrigin, SessionState};
