use std::net::{Ipv4Addr, SocketAddrV4};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use relnet::nat::GATEWAY_PORT;
use relnet::{
    Address, Clock, ConnectionConfig, ConnectionEvent, PcpConfig, PcpSession, PcpState,
    PmpConfig, PmpSession, Protocol, ReliableConnection,
};

#[derive(Parser)]
#[command(name = "relnet-probe")]
#[command(about = "Drives reliable UDP links and NAT gateway sessions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Wait for one peer and exchange packets with it
    Listen {
        #[arg(short, long, default_value_t = 30000)]
        port: u16,

        #[command(flatten)]
        link: LinkArgs,
    },
    /// Connect to a listening peer and exchange packets with it
    Connect {
        /// Peer as a.b.c.d:port
        peer: String,

        #[arg(short, long, default_value_t = 0)]
        port: u16,

        #[command(flatten)]
        link: LinkArgs,
    },
    /// Request a port mapping over PCP
    Pcp {
        /// Gateway as a.b.c.d[:port]
        gateway: String,

        #[command(flatten)]
        mapping: MappingArgs,

        #[arg(long, help = "Give up after this many requests")]
        max_retransmit_count: Option<u32>,

        #[arg(long, help = "Give up after this many seconds")]
        max_retransmit_duration: Option<u32>,
    },
    /// Request a port mapping over NAT-PMP
    Pmp {
        /// Gateway as a.b.c.d[:port]
        gateway: String,

        #[command(flatten)]
        mapping: MappingArgs,

        #[arg(long, default_value_t = relnet::config::PMP_RENEWAL_PORT)]
        renewal_port: u16,

        #[arg(long, help = "Do not listen for gateway announcements")]
        no_renewal: bool,
    },
}

#[derive(Args)]
struct LinkArgs {
    #[arg(long, default_value_t = relnet::config::DEFAULT_PROTOCOL_ID)]
    protocol_id: u32,

    #[arg(long, default_value_t = 10.0, help = "Link timeout in seconds")]
    timeout: f32,

    #[arg(short, long, default_value_t = 30)]
    tick_rate: u32,

    #[arg(long, default_value_t = 256)]
    payload_size: usize,

    #[arg(long, default_value_t = 0, help = "Drop sends whose sequence matches this mask")]
    loss_mask: u32,

    #[arg(long, help = "Stop after this many seconds")]
    duration: Option<f32>,
}

#[derive(Args)]
struct MappingArgs {
    #[arg(long, default_value = "udp")]
    protocol: Protocol,

    #[arg(long)]
    internal_port: u16,

    #[arg(long, default_value_t = 0)]
    external_port: u16,

    #[arg(long, default_value_t = relnet::config::DEFAULT_MAPPING_LIFETIME)]
    lifetime: u32,
}

const NAT_TICK_MS: u32 = 16;
const NAT_GIVE_UP_MS: u64 = 130_000;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Listen { port, link } => {
            let mut connection = start_link(port, &link)?;
            connection.listen();
            run_link(connection, &link)
        }
        Command::Connect { peer, port, link } => {
            let peer = parse_address(&peer, None)?;
            let mut connection = start_link(port, &link)?;
            connection.connect(peer);
            run_link(connection, &link)
        }
        Command::Pcp {
            gateway,
            mapping,
            max_retransmit_count,
            max_retransmit_duration,
        } => {
            let gateway = parse_address(&gateway, Some(GATEWAY_PORT))?;
            let config = PcpConfig {
                protocol: mapping.protocol,
                internal_port: mapping.internal_port,
                external_port: mapping.external_port,
                lifetime: mapping.lifetime,
                max_retransmit_count,
                max_retransmit_duration,
            };
            run_pcp(PcpSession::new(gateway, config)?)
        }
        Command::Pmp {
            gateway,
            mapping,
            renewal_port,
            no_renewal,
        } => {
            let gateway = parse_address(&gateway, Some(GATEWAY_PORT))?;
            let config = PmpConfig {
                protocol: mapping.protocol,
                internal_port: mapping.internal_port,
                external_port: mapping.external_port,
                lifetime: mapping.lifetime,
                renewal_port: (!no_renewal).then_some(renewal_port),
            };
            run_pmp(PmpSession::new(gateway, config)?)
        }
    }
}

fn parse_address(text: &str, default_port: Option<u16>) -> Result<Address> {
    if let Ok(addr) = text.parse::<SocketAddrV4>() {
        return Ok(Address::from(addr));
    }

    match (text.parse::<Ipv4Addr>(), default_port) {
        (Ok(ip), Some(port)) => Ok(Address::from_ip(ip, port)),
        (Ok(_), None) => bail!("'{}' needs a port", text),
        (Err(e), _) => Err(e).with_context(|| format!("invalid address '{}'", text)),
    }
}

fn start_link(port: u16, link: &LinkArgs) -> Result<ReliableConnection> {
    let config = ConnectionConfig {
        protocol_id: link.protocol_id,
        timeout: link.timeout,
        packet_loss_mask: link.loss_mask,
        ..Default::default()
    };

    if link.payload_size > relnet::MAX_RELIABLE_PAYLOAD_SIZE {
        bail!(
            "payload size {} exceeds {}",
            link.payload_size,
            relnet::MAX_RELIABLE_PAYLOAD_SIZE
        );
    }

    let mut connection = ReliableConnection::new(config);
    connection
        .start(port)
        .with_context(|| format!("cannot start link on port {}", port))?;
    Ok(connection)
}

fn run_link(mut connection: ReliableConnection, link: &LinkArgs) -> Result<()> {
    let tick = Duration::from_secs_f64(1.0 / link.tick_rate.max(1) as f64);
    let payload = vec![0u8; link.payload_size];
    let mut buf = vec![0u8; relnet::MAX_PACKET_SIZE];

    let mut clock = Clock::new();
    let mut report_timer = 0.0f32;
    let mut elapsed = 0.0f32;

    loop {
        if connection.connect_failed() {
            bail!("connection failed");
        }

        if let Err(e) = connection.send_packet(&payload) {
            log::trace!("send skipped: {}", e);
        }
        while connection.receive_packet(&mut buf) != 0 {}

        let dt = clock.tick();
        connection.update(dt);

        for event in connection.drain_events() {
            match event {
                ConnectionEvent::Connected { peer } => log::info!("connected to {}", peer),
                ConnectionEvent::Disconnected { peer, reason } => {
                    log::info!("{} {}", peer, reason.as_str())
                }
            }
        }

        report_timer += dt;
        if report_timer >= 1.0 {
            report_timer -= 1.0;
            if connection.connected() {
                log::info!("{}", connection.reliability_system().stats());
            } else {
                log::info!("state: {:?}", connection.state());
            }
        }

        elapsed += dt;
        if link.duration.is_some_and(|limit| elapsed >= limit) {
            log::info!("finished after {:.1}s", elapsed);
            return Ok(());
        }

        thread::sleep(tick);
    }
}

fn run_pcp(mut session: PcpSession) -> Result<()> {
    log::info!("pcp session bound on {}", session.local_addr());

    let clock = Clock::new();
    while session.state() == PcpState::RequestMapping {
        if clock.now_ms() > NAT_GIVE_UP_MS {
            bail!("no answer from pcp server {}", session.server());
        }
        session.update(NAT_TICK_MS);
        thread::sleep(Duration::from_millis(NAT_TICK_MS as u64));
    }

    match session.state() {
        PcpState::IdleMapped => {
            log::info!(
                "mapped to {}:{} for {}s",
                session.external_address(),
                session.external_port(),
                session.lifetime()
            );
            Ok(())
        }
        _ => bail!("pcp mapping failed: {:?}", session.result_code()),
    }
}

fn run_pmp(mut session: PmpSession) -> Result<()> {
    log::info!("pmp session bound on {}", session.local_addr());

    while !session.state().is_idle() {
        session.update(NAT_TICK_MS);
        thread::sleep(Duration::from_millis(NAT_TICK_MS as u64));
    }

    match session.state() {
        relnet::PmpState::IdleMapped => {
            log::info!(
                "mapped to {}:{} for {}s (gateway epoch {})",
                session.external_ip(),
                session.external_port(),
                session.lifetime(),
                session.epoch()
            );
            Ok(())
        }
        state => bail!(
            "pmp mapping failed in {:?}: {:?}",
            state,
            session.result_code()
        ),
    }
}
