//! tun-bridge: run the bridge on an inherited TUN descriptor
//!
//! The binary wires the bridge to a direct-connect dispatch substrate: every
//! TCP flow is connected straight to its destination and every UDP datagram
//! is sent from a fresh socket, with replies written back into the device.
//!
//! # Usage
//!
//! ```bash
//! # Run on descriptor 3 inherited from the parent process
//! tun-bridge -c /etc/tun-bridge/config.json --fd 3
//!
//! # Run with environment overrides
//! TUN_BRIDGE_LOG_LEVEL=debug TUN_BRIDGE_DNS=0.0.0.0 tun-bridge --fd 3
//! ```

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpStream, UdpSocket};
use tokio::signal;
use tracing::{debug, info, warn};

use tun_bridge::config::{create_default_config, load_config_with_env};
use tun_bridge::dispatch::{self, InboundQueues, TcpInbound, UdpInbound};
use tun_bridge::dns::upstream::DEFAULT_UPSTREAM_TIMEOUT;
use tun_bridge::dns::UpstreamResolver;
use tun_bridge::io::DEFAULT_UDP_BUFFER_SIZE;
use tun_bridge::logging::init_logging;
use tun_bridge::stack::ipstack::IpStackLauncher;
use tun_bridge::{Bridge, BridgeOptions};

/// How long a direct UDP socket waits for further replies
const UDP_REPLY_IDLE: Duration = Duration::from_secs(5);

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// TUN descriptor, overriding `tun.fd`
    fd: Option<RawFd>,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/tun-bridge/config.json");
        let mut fd = None;
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "--fd" => {
                    fd = args.next().and_then(|v| v.parse().ok());
                    if fd.is_none() {
                        eprintln!("--fd expects a descriptor number");
                        std::process::exit(1);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("tun-bridge v{}", tun_bridge::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            fd,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"tun-bridge v{}

Bridge a TUN device into TCP and UDP flows.

USAGE:
    tun-bridge [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/tun-bridge/config.json]
    --fd <N>                Inherited TUN descriptor [default: tun.fd from config]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    TUN_BRIDGE_LOG_LEVEL     Override log level (trace, debug, info, warn, error)
    TUN_BRIDGE_DNS           Override the hijacked resolver address
    TUN_BRIDGE_UDP_WORKERS   Override the number of UDP workers
"#,
        tun_bridge::VERSION
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        create_default_config(&args.config_path)
            .with_context(|| format!("writing {}", args.config_path.display()))?;
        println!("Default configuration written to {}", args.config_path.display());
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path)?;

    if args.check_config {
        println!("Configuration OK");
        return Ok(());
    }

    if let Err(e) = init_logging(&config.log) {
        eprintln!("Failed to initialize logging: {e}");
    }

    info!("tun-bridge v{} starting", tun_bridge::VERSION);

    let fd = args
        .fd
        .or(config.tun.fd)
        .context("no TUN descriptor: pass --fd or set tun.fd")?;
    // SAFETY: the descriptor is inherited from the parent process and nothing
    // else in this process owns it.
    let device_fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let (dispatcher, queues) = dispatch::channel(config.queue_capacity);
    let resolver = Arc::new(UpstreamResolver::from_ips(
        config.dns_defaults.nameserver_addrs()?,
        DEFAULT_UPSTREAM_TIMEOUT,
    ));
    let launcher = IpStackLauncher::new().with_mtu(config.tun.mtu);

    let bridge = Bridge::start_with_options(
        device_fd,
        &config.tun.gateway,
        &config.tun.portal,
        &config.tun.dns,
        BridgeOptions::from_config(&config)?,
        &launcher,
        dispatcher,
        resolver,
    )?;

    let substrate = tokio::spawn(run_direct(queues));

    signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutdown signal received");

    bridge.shutdown().await;
    substrate.abort();

    let stats = bridge.stats().snapshot();
    info!(
        tcp_dispatched = stats.tcp_dispatched,
        udp_dispatched = stats.udp_dispatched,
        dns_hijacked = stats.dns_hijacked(),
        "tun-bridge stopped"
    );

    Ok(())
}

/// Drain both queues, connecting everything directly
async fn run_direct(mut queues: InboundQueues) {
    loop {
        tokio::select! {
            Some(inbound) = queues.tcp.recv() => {
                tokio::spawn(direct_tcp(inbound));
            }
            Some(inbound) = queues.udp.recv() => {
                tokio::spawn(direct_udp(inbound));
            }
            else => break,
        }
    }
    debug!("Direct substrate stopped");
}

async fn direct_tcp(inbound: TcpInbound) {
    let TcpInbound { mut conn, metadata } = inbound;

    let mut upstream = match TcpStream::connect(metadata.raw_dst_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(%metadata, error = %e, "Direct connect failed");
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut conn.stream, &mut upstream).await {
        Ok((up, down)) => debug!(%metadata, up, down, "TCP flow finished"),
        Err(e) => debug!(%metadata, error = %e, "TCP flow ended"),
    }
}

async fn direct_udp(inbound: UdpInbound) {
    let UdpInbound { target, packet, .. } = inbound;

    let Some(target) = target.socket_addr() else {
        warn!(%target, "Domain targets are not supported by the direct substrate");
        return;
    };

    let bind: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = match UdpSocket::bind(bind).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(error = %e, "Failed to bind UDP socket");
            return;
        }
    };

    if let Err(e) = socket.send_to(packet.data(), target).await {
        debug!(%target, error = %e, "UDP send failed");
        return;
    }

    let mut buf = vec![0u8; DEFAULT_UDP_BUFFER_SIZE];
    while let Ok(Ok((n, from))) = tokio::time::timeout(UDP_REPLY_IDLE, socket.recv_from(&mut buf)).await {
        if let Err(e) = packet.write_back(&buf[..n], from).await {
            debug!(%from, error = %e, "UDP write back failed");
            break;
        }
    }

    packet.release();
}
