//! Output worker (spec §4.3, C3): owns the framebuffer allocator and the
//! peripheral, and is the sole mutator of both (spec §3 invariant I5). Lives
//! on its own thread, consuming commands strictly FIFO from a bounded
//! channel.

use crate::alloc::FbAllocator;
use crate::hal::{AckContext, AckSink, ChannelBitmask, OutputBackend};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

/// Command queue capacity (spec §4.3/§4.4: "a bounded MPSC channel"; the
/// protocol thread nacks and counts a frame rather than blocking once this
/// fills up).
pub const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Read-only view of the worker's live free-byte count, published after
/// every allocator mutation. Lets the protocol handler fill in the status
/// payload's `free_memory` field without reaching across the I5 ownership
/// boundary into the allocator itself.
#[derive(Clone)]
pub struct FreeMemoryHandle(Arc<AtomicUsize>);

impl FreeMemoryHandle {
    /// Starts out reporting the whole region free; the worker publishes
    /// real occupancy as soon as it processes its first command. Constructed
    /// independently of the worker so callers can hand a clone to the
    /// protocol handler before the worker itself exists.
    pub fn new(capacity: usize) -> FreeMemoryHandle {
        FreeMemoryHandle(Arc::new(AtomicUsize::new(capacity)))
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Running count of true `FbAllocator::allocate` exhaustion (spec §4.3 step
/// 1, §3's `frames_dropped_no_mem` field), published by the worker the same
/// way [`FreeMemoryHandle`] is. Distinct from a full command queue, which the
/// protocol thread counts itself since the worker never even sees that
/// frame: this handle only increments when the worker actually asked the
/// allocator for space and got `None` back.
#[derive(Clone)]
pub struct AllocFailureHandle(Arc<AtomicU64>);

impl AllocFailureHandle {
    pub fn new() -> AllocFailureHandle {
        AllocFailureHandle(Arc::new(AtomicU64::new(0)))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// One pending or active delivery (spec §3). Created by the protocol
/// handler, owned by the worker until acked, destroyed right after.
pub struct OutputFrame {
    pub channel: u16,
    pub data: Vec<u8>,
    pub ack_ctx: AckContext,
}

/// `(channel, address, length)` recording where a frame's pixels live in the
/// peripheral framebuffer (spec §3).
#[derive(Debug, Clone, Copy)]
struct ChannelPlacement {
    channel: u16,
    address: usize,
    length: usize,
}

pub enum Command {
    Enqueue(OutputFrame),
    SyncOutput(u32),
    Reclaim,
    Shutdown,
}

pub struct OutputWorker<B: OutputBackend> {
    backend: B,
    fb: FbAllocator,
    pending: Vec<ChannelPlacement>,
    active: Vec<ChannelPlacement>,
    sink: Arc<dyn AckSink>,
    commands: Receiver<Command>,
    free_memory: FreeMemoryHandle,
    alloc_failures: AllocFailureHandle,
    log: slog::Logger,
}

impl<B: OutputBackend> OutputWorker<B> {
    /// `free_memory` is published to on every allocator mutation; construct
    /// it with [`FreeMemoryHandle::new`] using the same capacity passed here
    /// and hand a clone to the protocol handler so it can fill in status
    /// replies (spec §4.4) without reaching across the I5 ownership boundary.
    /// `alloc_failures` is published to every time [`FbAllocator::allocate`]
    /// returns `None`; construct it with [`AllocFailureHandle::new`] and hand
    /// a clone to the protocol handler so it can fold true allocator
    /// exhaustion into `NodeState::counters.frames_dropped_no_mem`.
    pub fn new(
        backend: B,
        fb_capacity: usize,
        sink: Arc<dyn AckSink>,
        commands: Receiver<Command>,
        free_memory: FreeMemoryHandle,
        alloc_failures: AllocFailureHandle,
        log: slog::Logger,
    ) -> OutputWorker<B> {
        OutputWorker {
            backend,
            fb: FbAllocator::new(fb_capacity),
            pending: Vec::new(),
            active: Vec::new(),
            sink,
            commands,
            free_memory,
            alloc_failures,
            log,
        }
    }

    fn publish_bytes_free(&self) {
        self.free_memory.0.store(self.fb.bytes_free(), Ordering::Relaxed);
    }

    /// Runs the command loop until [`Command::Shutdown`] is received or the
    /// channel is closed. Each command is fully processed before the next is
    /// read (spec §4.3 "commands are processed strictly FIFO").
    pub fn run(mut self) {
        loop {
            match self.commands.recv_timeout(Duration::from_secs(3600)) {
                Ok(Command::Enqueue(frame)) => self.handle_enqueue(frame),
                Ok(Command::SyncOutput(mask)) => self.handle_sync(mask),
                Ok(Command::Reclaim) => self.reclaim(),
                Ok(Command::Shutdown) => {
                    slog::info!(self.log, "output worker shutting down");
                    break;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn handle_enqueue(&mut self, frame: OutputFrame) {
        let addr = match self.fb.allocate(frame.data.len()) {
            Some(addr) => addr,
            None => {
                self.alloc_failures.0.fetch_add(1, Ordering::Relaxed);
                slog::warn!(self.log, "framebuffer allocation failed"; "channel" => frame.channel, "len" => frame.data.len());
                self.sink.acknowledge_frame(frame.ack_ctx, true);
                return;
            }
        };
        self.publish_bytes_free();

        match self.backend.write_mem(addr, &frame.data) {
            Ok(_) => {
                self.pending.push(ChannelPlacement {
                    channel: frame.channel,
                    address: addr,
                    length: frame.data.len(),
                });
                self.sink.acknowledge_frame(frame.ack_ctx, false);
            }
            Err(err) => {
                slog::warn!(self.log, "peripheral write failed"; "channel" => frame.channel, "error" => %err);
                self.fb.free(addr, frame.data.len());
                self.publish_bytes_free();
                self.sink.acknowledge_frame(frame.ack_ctx, true);
            }
        }
    }

    fn handle_sync(&mut self, mask: u32) {
        self.reclaim();

        // Channels are programmed in ascending bit order (spec §4.3).
        for channel in 0..32u32 {
            if mask & (1 << channel) == 0 {
                continue;
            }

            let channel = channel as u16;
            if let Some(pos) = self.pending.iter().position(|p| p.channel == channel) {
                let placement = self.pending.remove(pos);

                match self
                    .backend
                    .program_channel(placement.channel, placement.address, placement.length)
                {
                    Ok(()) => self.active.push(placement),
                    Err(err) => {
                        slog::warn!(self.log, "program_channel failed"; "channel" => channel, "error" => %err);
                        self.fb.free(placement.address, placement.length);
                        self.publish_bytes_free();
                    }
                }
            }
            // A channel bit set with nothing pending is a silent no-op.
        }
    }

    fn reclaim(&mut self) {
        let status = match self.backend.read_status() {
            Ok(status) => status,
            Err(err) => {
                slog::warn!(self.log, "status read failed during reclaim, skipping this cycle"; "error" => %err);
                return;
            }
        };

        let fb = &mut self.fb;
        self.active.retain(|placement| {
            let still_emitting = ChannelBitmask::is_set(status, placement.channel);
            if !still_emitting {
                fb.free(placement.address, placement.length);
            }
            still_emitting
        });
        self.publish_bytes_free();
    }

    pub fn bytes_free(&self) -> usize {
        self.fb.bytes_free()
    }
}

pub type CommandSender = SyncSender<Command>;
