//! Built-in [`OutputBackend`] used when no hardware driver is linked in.
//! Concrete SPI/PWM backends are an external collaborator (spec §9
//! "dynamic library plugins" becomes trait selection, not runtime symbol
//! lookup) and live outside this crate; this is the one entry the static
//! registry ships with.

use led_core::hal::{ChannelBitmask, HalResult, OutputBackend};

pub struct NullBackend {
    log: slog::Logger,
}

impl NullBackend {
    pub fn new(log: slog::Logger) -> NullBackend {
        NullBackend { log }
    }
}

impl OutputBackend for NullBackend {
    fn reset(&mut self) -> HalResult<()> {
        slog::debug!(self.log, "backend reset");
        Ok(())
    }

    fn write_mem(&mut self, addr: usize, data: &[u8]) -> HalResult<usize> {
        slog::debug!(self.log, "backend write_mem"; "addr" => addr, "len" => data.len());
        Ok(data.len())
    }

    fn program_channel(&mut self, channel: u16, addr: usize, length: usize) -> HalResult<()> {
        slog::debug!(self.log, "backend program_channel"; "channel" => channel, "addr" => addr, "length" => length);
        Ok(())
    }

    fn read_status(&mut self) -> HalResult<ChannelBitmask> {
        Ok(ChannelBitmask(0))
    }
}
