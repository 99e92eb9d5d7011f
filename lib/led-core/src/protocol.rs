//! Protocol handler (spec §4.4, C4): single-threaded UDP event loop that
//! decodes datagrams, drives the node adoption state machine, answers status
//! queries, and dispatches frames and sync commands to the output worker.

use crate::announce::AnnounceScheduler;
use crate::error::{ResourceError, StateError};
use crate::hal::{AckContext, AckSink};
use crate::state::{HostIdentity, NodeState};
use crate::worker::{AllocFailureHandle, Command, CommandSender, FreeMemoryHandle, OutputFrame};
use led_wire::header::{Flags, Header, Opcode, HEADER_LEN};
use led_wire::payload::{Announcement, FramebufferData, Status, SyncOutput};
use led_wire::WireError;
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::TrySendError;
use std::sync::Arc;
use std::time::{Duration, Instant};

const UNICAST_TOKEN: Token = Token(0);
const MULTICAST_TOKEN: Token = Token(1);
const WAKE_TOKEN: Token = Token(2);

const MAX_DATAGRAM: usize = 2048;
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Software/hardware version numbers advertised in announcements.
const SOFTWARE_VERSION: u32 = 1;
const HARDWARE_VERSION: u32 = 1;

pub struct ProtocolConfig {
    pub listen_addr: SocketAddr,
    pub multicast_group: Ipv4Addr,
    pub announce_initial: Duration,
    pub announce_steady: Duration,
    pub framebuffer_capacity: u32,
    pub channel_count: u16,
}

/// Sends acks directly on the shared send socket; used both as the worker's
/// `AckSink` and for unicast/multicast sends issued from this handler.
pub struct UdpAckSink {
    socket: Arc<UdpSocket>,
}

impl UdpAckSink {
    pub fn new(socket: Arc<UdpSocket>) -> UdpAckSink {
        UdpAckSink { socket }
    }
}

impl AckSink for UdpAckSink {
    fn acknowledge_frame(&self, ctx: AckContext, nack: bool) {
        let mut buf = vec![0u8; HEADER_LEN];
        Header::build(&mut buf, ctx.opcode);

        let mut flags = Flags::ACK | Flags::RESPONSE;
        if nack {
            flags.make_nack();
        }

        Header::set_meta(&mut buf, flags, ctx.txn, 0);
        Header::apply_checksum(&mut buf);

        let _ = self.socket.send_to(&buf, ctx.source);
    }
}

pub struct ProtocolHandler {
    unicast_socket: MioUdpSocket,
    multicast_socket: MioUdpSocket,
    send_socket: Arc<UdpSocket>,
    poll: Poll,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,

    node: NodeState,
    announce: AnnounceScheduler,
    worker_commands: CommandSender,
    free_memory: FreeMemoryHandle,
    alloc_failures: AllocFailureHandle,
    observed_alloc_failures: u64,
    config: ProtocolConfig,

    log: slog::Logger,
}

impl ProtocolHandler {
    pub fn new(
        config: ProtocolConfig,
        identity: HostIdentity,
        worker_commands: CommandSender,
        free_memory: FreeMemoryHandle,
        alloc_failures: AllocFailureHandle,
        log: slog::Logger,
    ) -> std::io::Result<ProtocolHandler> {
        let unicast_std = bind_unicast(config.listen_addr)?;
        let multicast_std = bind_multicast(config.listen_addr.port(), config.multicast_group)?;

        let mut unicast_socket = MioUdpSocket::from_std(unicast_std);
        let mut multicast_socket = MioUdpSocket::from_std(multicast_std);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut unicast_socket, UNICAST_TOKEN, Interest::READABLE)?;
        poll.registry()
            .register(&mut multicast_socket, MULTICAST_TOKEN, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);

        let send_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        send_socket.set_nonblocking(false)?;

        let now = Instant::now();
        let announce = AnnounceScheduler::new(config.announce_initial, config.announce_steady, now);
        let node = NodeState::new(identity);

        Ok(ProtocolHandler {
            unicast_socket,
            multicast_socket,
            send_socket: Arc::new(send_socket),
            poll,
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
            node,
            announce,
            worker_commands,
            free_memory,
            alloc_failures,
            observed_alloc_failures: 0,
            config,
            log,
        })
    }

    /// A handle that, when dropped or signalled via [`Self::shutdown_handle`],
    /// wakes the event loop so it can observe the shutdown flag promptly.
    pub fn shutdown_handle(&self) -> ProtocolShutdown {
        ProtocolShutdown {
            flag: self.shutdown.clone(),
            waker: self.waker.clone(),
        }
    }

    pub fn ack_sink(&self) -> Arc<dyn AckSink> {
        Arc::new(UdpAckSink::new(self.send_socket.clone()))
    }

    pub fn run(mut self) {
        let mut events = Events::with_capacity(256);
        let mut recv_buf = [0u8; MAX_DATAGRAM];

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                slog::info!(self.log, "protocol handler shutting down");
                break;
            }

            let now = Instant::now();
            let timeout = self
                .announce
                .next_deadline()
                .saturating_duration_since(now)
                .max(Duration::from_millis(1));

            if let Err(err) = self.poll.poll(&mut events, Some(timeout)) {
                if err.kind() != ErrorKind::Interrupted {
                    slog::error!(self.log, "poll failed"; "error" => %err);
                }
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    UNICAST_TOKEN => self.drain_socket(false, &mut recv_buf),
                    MULTICAST_TOKEN => self.drain_socket(true, &mut recv_buf),
                    WAKE_TOKEN => {}
                    _ => unreachable!(),
                }
            }

            let now = Instant::now();
            if self.node.expire_if_silent(now, KEEPALIVE_TIMEOUT) {
                slog::info!(self.log, "controller silent past keepalive timeout, reverting to unadopted");
            }

            self.reconcile_alloc_failures();

            if self.announce.is_due(now) {
                self.send_announcement();
                self.announce.on_announced(now);
            }
        }
    }

    /// Folds true allocator exhaustion the output worker has published into
    /// [`AllocFailureHandle`] since the last tick into
    /// `NodeState::counters.frames_dropped_no_mem` — distinct from the count
    /// this handler adds itself when the command queue is full, since in
    /// that case the worker never even sees the frame.
    fn reconcile_alloc_failures(&mut self) {
        let total = self.alloc_failures.get();
        let delta = total.saturating_sub(self.observed_alloc_failures);
        if delta > 0 {
            self.node.counters.frames_dropped_no_mem += delta;
            self.observed_alloc_failures = total;
        }
    }

    fn drain_socket(&mut self, multicast: bool, buf: &mut [u8]) {
        loop {
            let (len, source) = {
                let socket = if multicast {
                    &self.multicast_socket
                } else {
                    &self.unicast_socket
                };
                match socket.recv_from(buf) {
                    Ok(v) => v,
                    Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                    Err(err) => {
                        slog::warn!(self.log, "recv_from failed"; "error" => %err);
                        return;
                    }
                }
            };

            self.handle_datagram(&buf[..len], source, multicast);
        }
    }

    fn handle_datagram(&mut self, bytes: &[u8], source: SocketAddr, multicast: bool) {
        let now = Instant::now();

        if let Err(err) = Header::validate(bytes) {
            if err == WireError::BadChecksum {
                self.node.counters.bad_crc += 1;
            }
            return;
        }

        // The validator's own return value drives the rest of dispatch; the
        // reference bug of reading a stale local instead is not reproduced.
        let header = match Header::decode(bytes) {
            Ok(h) => h,
            Err(_) => return,
        };

        let payload = &bytes[HEADER_LEN..HEADER_LEN + header.payload_length as usize];
        let is_request = header.payload_length == 0;

        // Spec §4.4's dispatch table only names NODE_ADOPTION and KEEPALIVE
        // as updating `last_controller_msg_at`; every other arm leaves the
        // keepalive clock alone so a silent-but-adopted controller is still
        // detected by `NodeState::expire_if_silent`.
        match header.opcode {
            Opcode::NodeStatus if is_request => {
                self.reply_status(header.txn, source);
            }
            Opcode::NodeAdoption => {
                if self.node.adopted {
                    self.node.note_controller_contact(now);
                    slog::info!(self.log, "adoption request refused"; "error" => %StateError::AlreadyAdopted, "source" => %source);
                } else {
                    self.node.adopt(now);
                    slog::info!(self.log, "node adopted"; "source" => %source);
                }
            }
            Opcode::FramebufferData => {
                self.handle_framebuffer_data(payload, header.txn, source);
            }
            Opcode::SyncOutput => {
                self.handle_sync_output(payload, header.txn, source, multicast);
            }
            Opcode::Keepalive => {
                self.node.note_controller_contact(now);
                self.ack_unicast(Opcode::Keepalive, header.txn, source, false);
            }
            _ => {
                slog::debug!(self.log, "unimplemented opcode"; "opcode" => ?header.opcode);
            }
        }
    }

    /// Spec §3 invariant I4: framebuffer-data and sync-output are refused
    /// outright while the node is unadopted.
    fn check_adopted(&self) -> Result<(), StateError> {
        if self.node.adopted {
            Ok(())
        } else {
            Err(StateError::NotAdopted)
        }
    }

    fn handle_framebuffer_data(&mut self, payload: &[u8], txn: u32, source: SocketAddr) {
        if let Err(err) = self.check_adopted() {
            self.node.counters.frames_dropped_not_adopted += 1;
            slog::debug!(self.log, "rejecting framebuffer data"; "error" => %err, "source" => %source);
            self.ack_unicast(Opcode::FramebufferData, txn, source, true);
            return;
        }

        let fb = match FramebufferData::decode(payload) {
            Ok(fb) => fb,
            Err(_) => {
                self.node.counters.bad_crc += 1;
                return;
            }
        };

        let frame = OutputFrame {
            channel: fb.channel,
            data: fb.pixels,
            ack_ctx: AckContext {
                source,
                opcode: Opcode::FramebufferData,
                txn,
            },
        };

        // Spec §4.4 concurrency contract: never block on C3's queue; a full
        // queue is treated exactly like allocator exhaustion downstream.
        if let Err(err) = self.worker_commands.try_send(Command::Enqueue(frame)) {
            self.node.counters.frames_dropped_no_mem += 1;
            let reason = match err {
                TrySendError::Full(_) => "output worker queue full",
                TrySendError::Disconnected(_) => "output worker queue closed",
            };
            slog::warn!(self.log, "dropping frame"; "error" => %ResourceError::NoMem, "reason" => reason, "source" => %source);
            self.ack_unicast(Opcode::FramebufferData, txn, source, true);
        }
    }

    fn handle_sync_output(&mut self, payload: &[u8], txn: u32, source: SocketAddr, multicast: bool) {
        if let Err(err) = self.check_adopted() {
            self.node.counters.sync_dropped += 1;
            slog::debug!(self.log, "rejecting sync-output"; "error" => %err, "source" => %source);
            if !multicast {
                self.ack_unicast(Opcode::SyncOutput, txn, source, true);
            }
            return;
        }

        let sync = match SyncOutput::decode(payload) {
            Ok(sync) => sync,
            Err(_) => {
                self.node.counters.bad_crc += 1;
                return;
            }
        };

        match self.worker_commands.try_send(Command::SyncOutput(sync.channel_mask)) {
            Ok(()) => {
                // Only a unicast sync receives an ack (spec §4.4).
                if !multicast {
                    self.ack_unicast(Opcode::SyncOutput, txn, source, false);
                }
            }
            Err(_) => {
                self.node.counters.sync_dropped += 1;
                slog::warn!(self.log, "dropping sync-output, worker queue full"; "source" => %source);
                if !multicast {
                    self.ack_unicast(Opcode::SyncOutput, txn, source, true);
                }
            }
        }
    }

    fn reply_status(&mut self, txn: u32, source: SocketAddr) {
        let status = Status {
            uptime_secs: self.node.uptime_secs(),
            total_memory: self.config.framebuffer_capacity,
            free_memory: self.free_memory.get() as u32,
            bad_crc_count: self.node.counters.bad_crc as u32,
            cpu_load_percent: 0,
        };

        let mut payload = Vec::new();
        status.encode(&mut payload);

        let mut buf = vec![0u8; HEADER_LEN];
        Header::build(&mut buf, Opcode::NodeStatus);
        Header::set_meta(&mut buf, Flags::ACK | Flags::RESPONSE, txn, payload.len() as u32);
        buf.extend_from_slice(&payload);
        Header::apply_checksum(&mut buf);

        let _ = self.send_socket.send_to(&buf, source);
    }

    fn ack_unicast(&mut self, opcode: Opcode, txn: u32, source: SocketAddr, nack: bool) {
        let mut buf = vec![0u8; HEADER_LEN];
        Header::build(&mut buf, opcode);

        let mut flags = Flags::ACK | Flags::RESPONSE;
        if nack {
            flags.make_nack();
        }

        Header::set_meta(&mut buf, flags, txn, 0);
        Header::apply_checksum(&mut buf);

        let _ = self.send_socket.send_to(&buf, source);
    }

    fn send_announcement(&mut self) {
        let announcement = Announcement {
            software_version: SOFTWARE_VERSION,
            hardware_version: HARDWARE_VERSION,
            listen_port: self.config.listen_addr.port(),
            advertised_ipv4: self.node.identity.ipv4,
            mac: self.node.identity.mac,
            framebuffer_capacity: self.config.framebuffer_capacity,
            channel_count: self.config.channel_count,
            hostname: self.node.identity.hostname.clone(),
        };

        let mut payload = Vec::new();
        announcement.encode(&mut payload);

        let mut buf = vec![0u8; HEADER_LEN];
        Header::build(&mut buf, Opcode::NodeAnnouncement);
        Header::set_meta(&mut buf, Flags::MULTICAST, 0, payload.len() as u32);
        buf.extend_from_slice(&payload);
        Header::apply_checksum(&mut buf);

        let dest = SocketAddr::new(self.config.multicast_group.into(), self.config.listen_addr.port());
        let _ = self.send_socket.send_to(&buf, dest);
    }
}

/// Lets `main` request a clean shutdown of the protocol event loop from
/// outside its thread (spec §5 "Main → Protocol(shutdown) → Output").
pub struct ProtocolShutdown {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ProtocolShutdown {
    pub fn request(&self) {
        self.flag.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use led_wire::payload::PixelFormat;
    use std::net::UdpSocket as StdUdpSocket;
    use std::sync::mpsc;

    fn test_config() -> ProtocolConfig {
        ProtocolConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            multicast_group: led_wire::DEFAULT_MULTICAST_GROUP,
            announce_initial: Duration::from_secs(1),
            announce_steady: Duration::from_secs(10),
            framebuffer_capacity: 4096,
            channel_count: 4,
        }
    }

    fn test_handler() -> (ProtocolHandler, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::sync_channel(crate::worker::COMMAND_QUEUE_CAPACITY);
        let handler = ProtocolHandler::new(
            test_config(),
            HostIdentity::default(),
            tx,
            FreeMemoryHandle::new(4096),
            AllocFailureHandle::new(),
            slog::Logger::root(slog::Discard, slog::o!()),
        )
        .expect("binding to an ephemeral loopback port should succeed");
        (handler, rx)
    }

    fn build_request(opcode: Opcode, txn: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN];
        Header::build(&mut buf, opcode);
        Header::set_meta(&mut buf, Flags::NONE, txn, payload.len() as u32);
        buf.extend_from_slice(payload);
        Header::apply_checksum(&mut buf);
        buf
    }

    /// Scenario 1 (spec §8): status request gets an ACK+RESPONSE reply with
    /// the same txn and a free_memory no greater than total_memory.
    #[test]
    fn status_request_replies_with_ack_and_memory_snapshot() {
        let (mut handler, _rx) = test_handler();
        let client = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let source = client.local_addr().unwrap();

        let req = build_request(Opcode::NodeStatus, 42, &[]);
        handler.handle_datagram(&req, source, false);

        let mut buf = [0u8; 128];
        let (len, _) = client.recv_from(&mut buf).expect("status reply");
        assert!(Header::validate(&buf[..len]).is_ok());

        let hdr = Header::decode(&buf[..len]).unwrap();
        assert_eq!(hdr.txn, 42);
        assert!(hdr.flags.contains(Flags::ACK));
        assert!(hdr.flags.contains(Flags::RESPONSE));

        let status = Status::decode(&buf[HEADER_LEN..len]).unwrap();
        assert!(status.free_memory <= status.total_memory);
    }

    /// Scenario 2 (spec §8): a single flipped checksum bit is dropped
    /// silently and counted, never decoded or replied to.
    #[test]
    fn bad_checksum_increments_counter_and_drops_silently() {
        let (mut handler, _rx) = test_handler();
        let client = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        let source = client.local_addr().unwrap();

        let mut req = build_request(Opcode::Keepalive, 1, &[]);
        req[8] ^= 0x01; // flip a bit in the checksum field

        handler.handle_datagram(&req, source, false);

        assert_eq!(handler.node.counters.bad_crc, 1);
        let mut buf = [0u8; 64];
        assert!(client.recv_from(&mut buf).is_err());
    }

    /// Scenario 3 (spec §8): framebuffer data while unadopted is nacked and
    /// counted, and never reaches the output worker's command queue.
    #[test]
    fn framebuffer_data_while_unadopted_is_nacked() {
        let (mut handler, rx) = test_handler();
        let client = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let source = client.local_addr().unwrap();

        let fb = FramebufferData {
            channel: 0,
            format: PixelFormat::Rgb,
            element_count: 10,
            pixels: vec![0u8; 30],
        };
        let mut payload = Vec::new();
        fb.encode(&mut payload);

        let req = build_request(Opcode::FramebufferData, 5, &payload);
        handler.handle_datagram(&req, source, false);

        assert_eq!(handler.node.counters.frames_dropped_not_adopted, 1);
        assert!(rx.try_recv().is_err());

        let mut buf = [0u8; 64];
        let (len, _) = client.recv_from(&mut buf).expect("nack reply");
        let hdr = Header::decode(&buf[..len]).unwrap();
        assert_eq!(hdr.txn, 5);
        assert!(hdr.flags.contains(Flags::NACK));
        assert!(!hdr.flags.contains(Flags::ACK));
    }

    /// Scenario 4 (spec §8), protocol-side half: once adopted, framebuffer
    /// data and sync-output are forwarded to the output worker's command
    /// queue in the order they were received, and a multicast sync is never
    /// acked.
    #[test]
    fn adopted_node_forwards_frame_and_sync_commands_in_order() {
        let (mut handler, rx) = test_handler();
        let source: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let adopt_req = build_request(Opcode::NodeAdoption, 1, &[]);
        handler.handle_datagram(&adopt_req, source, false);
        assert!(handler.node.adopted);

        let fb = FramebufferData {
            channel: 3,
            format: PixelFormat::Rgb,
            element_count: 10,
            pixels: vec![0u8; 30],
        };
        let mut fb_payload = Vec::new();
        fb.encode(&mut fb_payload);
        let fb_req = build_request(Opcode::FramebufferData, 2, &fb_payload);
        handler.handle_datagram(&fb_req, source, false);

        let sync = SyncOutput { channel_mask: 1 << 3 };
        let mut sync_payload = Vec::new();
        sync.encode(&mut sync_payload);
        let sync_req = build_request(Opcode::SyncOutput, 3, &sync_payload);
        handler.handle_datagram(&sync_req, source, true);

        match rx.try_recv() {
            Ok(Command::Enqueue(frame)) => {
                assert_eq!(frame.channel, 3);
                assert_eq!(frame.data.len(), 30);
            }
            _ => panic!("expected an Enqueue command first"),
        }

        match rx.try_recv() {
            Ok(Command::SyncOutput(mask)) => assert_eq!(mask, 1 << 3),
            _ => panic!("expected a SyncOutput command second"),
        }
    }

    /// Spec §3 invariant I4, sync side: sync-output while unadopted is
    /// counted and, for unicast, nacked; multicast gets no reply at all.
    #[test]
    fn sync_output_while_unadopted_is_dropped_and_counted() {
        let (mut handler, rx) = test_handler();
        let source: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let sync = SyncOutput { channel_mask: 0b1 };
        let mut payload = Vec::new();
        sync.encode(&mut payload);
        let req = build_request(Opcode::SyncOutput, 9, &payload);

        handler.handle_datagram(&req, source, true);

        assert_eq!(handler.node.counters.sync_dropped, 1);
        assert!(rx.try_recv().is_err());
    }

    /// Allocator exhaustion surfaces on the worker's side via
    /// [`AllocFailureHandle`], not as a direct counter mutation (spec §5 —
    /// the worker never touches `NodeState`); the protocol loop's tick-time
    /// reconciliation is what folds it into `frames_dropped_no_mem`.
    #[test]
    fn reconcile_folds_worker_reported_alloc_failures_into_counters() {
        let (tx, _rx) = mpsc::sync_channel(crate::worker::COMMAND_QUEUE_CAPACITY);
        let alloc_failures = AllocFailureHandle::new();
        let mut handler = ProtocolHandler::new(
            test_config(),
            HostIdentity::default(),
            tx,
            FreeMemoryHandle::new(4096),
            alloc_failures.clone(),
            slog::Logger::root(slog::Discard, slog::o!()),
        )
        .expect("binding to an ephemeral loopback port should succeed");

        assert_eq!(handler.node.counters.frames_dropped_no_mem, 0);

        // Simulate the output worker hitting two real allocation failures.
        alloc_failures.0.fetch_add(2, Ordering::Relaxed);
        handler.reconcile_alloc_failures();
        assert_eq!(handler.node.counters.frames_dropped_no_mem, 2);

        // A second reconcile with no new failures is a no-op.
        handler.reconcile_alloc_failures();
        assert_eq!(handler.node.counters.frames_dropped_no_mem, 2);
    }
}

fn bind_unicast(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProtocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Binds a second socket directly to the multicast group so datagrams
/// arriving there are trivially distinguishable from unicast traffic,
/// without needing IP_PKTINFO / recvmsg ancillary data.
fn bind_multicast(port: u16, group: Ipv4Addr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProtocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    let bind_addr = SocketAddrV4::new(group, port);
    socket.bind(&bind_addr.into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;

    Ok(socket.into())
}
