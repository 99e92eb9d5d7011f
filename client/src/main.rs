//! CLI / process entry point (spec §6, §4.9, C9). Grounded on
//! `services/authenticator/src/main.rs`'s argument-parsing and logger-init
//! shape, adapted to this crate's two-thread (protocol + output) layout and
//! its `Main -> Protocol -> Output` shutdown ordering (spec §5).

mod backend;
mod config;

use clap::Parser;
use config::NodeConfig;
use led_core::hal::AckSink;
use led_core::protocol::{ProtocolConfig, ProtocolHandler};
use led_core::state::HostIdentity;
use led_core::worker::{
    AllocFailureHandle, Command, FreeMemoryHandle, OutputWorker, COMMAND_QUEUE_CAPACITY,
};
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "lichtenstein-client", about = "Lichtenstein LED fabric node client")]
struct Args {
    /// Path to a TOML config file. Falls back to built-in defaults if omitted.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable debug-level logging.
    #[arg(long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let log = led_wire::logging::init(args.verbose);

    let config = match &args.config {
        Some(path) => match NodeConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                slog::error!(log, "failed to load config, aborting"; "error" => %err);
                return ExitCode::FAILURE;
            }
        },
        None => NodeConfig::default(),
    };

    let identity = discover_host_identity(&config);
    slog::info!(log, "starting node"; "hostname" => &identity.hostname, "ip" => %identity.ipv4);

    let (command_tx, command_rx) = mpsc::sync_channel::<Command>(COMMAND_QUEUE_CAPACITY);

    let listen_addr = SocketAddr::new(config.client.listen.into(), config.client.port);
    let protocol_config = ProtocolConfig {
        listen_addr,
        multicast_group: config.client.multicast_group,
        announce_initial: Duration::from_secs(config.client.announcement_interval_initial),
        announce_steady: Duration::from_secs(config.client.announcement_interval),
        framebuffer_capacity: config.output.fbsize,
        channel_count: config.output.channels,
    };

    let free_memory = FreeMemoryHandle::new(config.output.fbsize as usize);
    let alloc_failures = AllocFailureHandle::new();

    let protocol_handler = match ProtocolHandler::new(
        protocol_config,
        identity,
        command_tx.clone(),
        free_memory.clone(),
        alloc_failures.clone(),
        log.new(slog::o!("thread" => "protocol")),
    ) {
        Ok(handler) => handler,
        Err(err) => {
            slog::error!(log, "failed to bind listen socket, aborting"; "error" => %err);
            return ExitCode::FAILURE;
        }
    };

    let ack_sink: Arc<dyn AckSink> = protocol_handler.ack_sink();
    let shutdown = protocol_handler.shutdown_handle();

    let backend = backend::NullBackend::new(log.new(slog::o!("thread" => "output")));
    let worker = OutputWorker::new(
        backend,
        config.output.fbsize as usize,
        ack_sink,
        command_rx,
        free_memory,
        alloc_failures,
        log.new(slog::o!("thread" => "output")),
    );

    let output_thread = std::thread::Builder::new()
        .name("output".into())
        .spawn(move || worker.run())
        .expect("failed to spawn output thread");

    let protocol_thread = std::thread::Builder::new()
        .name("protocol".into())
        .spawn(move || protocol_handler.run())
        .expect("failed to spawn protocol thread");

    if let Err(err) = ctrlc::set_handler(move || shutdown.request()) {
        slog::warn!(log, "failed to install SIGINT handler, ctrl-c will not shut down cleanly"; "error" => %err);
    }

    let _ = protocol_thread.join();
    let _ = command_tx.send(Command::Shutdown);
    let _ = output_thread.join();

    slog::info!(log, "shutdown complete");
    ExitCode::SUCCESS
}

/// Resolves MAC/IPv4/hostname once at startup (spec §3 expansion: "Host
/// identity ... is resolved once at startup by C9 and refreshed into the
/// announcement payload at send time"). IPv4 discovery follows the
/// three-tier order: an explicit `advertise_address` wins outright; failing
/// that, a concrete (non-wildcard) `listen` address is already what the
/// socket is bound to and needs no further discovery; only when both are
/// silent do we fall back to the "connect a UDP socket, read back the local
/// address" trick (no traffic is actually sent).
fn discover_host_identity(config: &NodeConfig) -> HostIdentity {
    let ipv4 = config
        .client
        .advertise_address
        .or_else(|| {
            if config.client.listen != Ipv4Addr::UNSPECIFIED {
                Some(config.client.listen)
            } else {
                None
            }
        })
        .unwrap_or_else(|| {
            UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
                .and_then(|socket| {
                    socket.connect((Ipv4Addr::new(198, 51, 100, 1), 9))?;
                    socket.local_addr()
                })
                .ok()
                .and_then(|addr| match addr.ip() {
                    std::net::IpAddr::V4(v4) => Some(v4),
                    std::net::IpAddr::V6(_) => None,
                })
                .unwrap_or(Ipv4Addr::UNSPECIFIED)
        });

    let hostname = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "lichtenstein-node".to_string());

    let mac = discover_mac_address().unwrap_or([0; 6]);

    HostIdentity {
        mac,
        ipv4,
        hostname,
    }
}

/// Takes the MAC of the host's default outbound interface, which in
/// practice is the first non-loopback link-layer address `mac_address`
/// resolves via the OS's interface list. Falls back to `None` (an all-zero
/// MAC) on platforms or sandboxes where no such interface can be found.
fn discover_mac_address() -> Option<[u8; 6]> {
    mac_address::get_mac_address()
        .ok()
        .flatten()
        .map(|mac| mac.bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_flag_is_optional() {
        let args = Args::try_parse_from(["lichtenstein-client"]).unwrap();
        assert_eq!(args.config, None);
        assert!(!args.verbose);
    }

    #[test]
    fn config_flag_accepts_a_path() {
        let args =
            Args::try_parse_from(["lichtenstein-client", "--config", "/etc/node.toml"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/etc/node.toml")));
    }

    #[test]
    fn verbose_flag_selects_debug_level_logging() {
        let args = Args::try_parse_from(["lichtenstein-client", "--verbose"]).unwrap();
        assert!(args.verbose);
    }
}
