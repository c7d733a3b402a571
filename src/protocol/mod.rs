//! Wire protocol: record framing, the framed crypto channel, and the
//! control-message vocabulary multiplexed onto it.

pub mod channel;
pub mod control;
pub mod framing;

pub use channel::{spawn_flusher, ChannelReader, ChannelWriter};
pub use control::ControlMessage;
pub use framing::{read_frame, write_frame, RecordReader, RecordWriter};
