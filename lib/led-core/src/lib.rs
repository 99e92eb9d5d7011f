#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod alloc;
pub mod announce;
pub mod error;
pub mod hal;
pub mod protocol;
pub mod state;
pub mod worker;

pub use alloc::FbAllocator;
pub use announce::AnnounceScheduler;
pub use hal::{AckContext, AckSink, ChannelBitmask, HalError, HalResult, OutputBackend};
pub use protocol::{ProtocolConfig, ProtocolHandler, ProtocolShutdown, UdpAckSink};
pub use state::{Counters, HostIdentity, NodeState};
pub use worker::{
    AllocFailureHandle, Command, CommandSender, FreeMemoryHandle, OutputFrame, OutputWorker,
    COMMAND_QUEUE_CAPACITY,
};
