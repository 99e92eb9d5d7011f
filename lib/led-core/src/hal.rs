//! Hardware abstraction contract the core drives (spec §4.7, C7). Concrete
//! SPI/PWM/kernel-driver backends are external collaborators; the core only
//! depends on this trait plus [`AckSink`], the interface the output worker
//! uses to hand delivery results back to the protocol handler.

use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct ChannelBitmask(pub u16);

impl ChannelBitmask {
    #[inline]
    pub fn is_set(self, channel: u16) -> bool {
        channel < 16 && (self.0 & (1 << channel)) != 0
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HalError {
    Timeout,
    Io,
    NotReady,
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalError::Timeout => write!(f, "peripheral operation timed out"),
            HalError::Io => write!(f, "peripheral i/o error"),
            HalError::NotReady => write!(f, "peripheral not ready"),
        }
    }
}

impl std::error::Error for HalError {}

pub type HalResult<T> = Result<T, HalError>;

/// Operations the core drives against the physical output peripheral. A
/// concrete SPI/PWM/kernel-driver implementation lives outside this crate
/// and is selected at startup from a config-named registry (spec §9 —
/// dynamic plugin loading becomes trait selection, no runtime symbol
/// lookup).
pub trait OutputBackend {
    /// Deasserts all outputs. Blocks up to a small fixed duration.
    fn reset(&mut self) -> HalResult<()>;

    /// Copies `data` into peripheral memory starting at `addr`.
    fn write_mem(&mut self, addr: usize, data: &[u8]) -> HalResult<usize>;

    /// Latches a DMA descriptor for `channel` and starts emission.
    fn program_channel(&mut self, channel: u16, addr: usize, length: usize) -> HalResult<()>;

    /// Bit *i* set iff channel *i* is currently emitting.
    fn read_status(&mut self) -> HalResult<ChannelBitmask>;

    /// Optional self-test; cycles colors across all channels.
    fn output_test(&mut self) -> HalResult<()> {
        Ok(())
    }
}

/// Interface the output worker uses to deliver exactly one ack or nack per
/// frame (spec §3 invariant I2, §9 "hand-managed memory / cyclic backrefs").
/// No `OutputFrame` holds a pointer back into the protocol handler; instead
/// the worker calls `sink.acknowledge_frame(..)` when it is done with a
/// frame, using the frame's own saved ack context.
pub trait AckSink: Send + Sync {
    fn acknowledge_frame(&self, ctx: AckContext, nack: bool);
}

/// Enough information to build and send an ack/nack datagram without the
/// worker needing to know about sockets or the protocol handler's state.
#[derive(Debug, Clone, Copy)]
pub struct AckContext {
    pub source: std::net::SocketAddr,
    pub opcode: led_wire::Opcode,
    pub txn: u32,
}

/// A small fixed timeout the worker tolerates before giving up on a single
/// peripheral operation; mirrors the reference's "blocks up to a small
/// fixed duration" language for `reset()`.
pub const PERIPHERAL_OP_TIMEOUT: Duration = Duration::from_millis(250);
