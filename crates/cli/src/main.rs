use clap::Parser;
use rtsp_media::packet::rtcp_packet_kind;
use rtsp_media::{
    Direction, Format, Media, MediaKind, MediaSetup, Server, ServerConfig, ServerSession,
    SessionMedia, Transport,
};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "rtsp-media-probe",
    about = "Receive a recorded RTP stream over UDP and log what arrives"
)]
struct Args {
    /// Local RTP listener address (even port; RTCP uses the next one)
    #[arg(long, default_value = "0.0.0.0:8000")]
    rtp: SocketAddr,

    /// Address of the publishing client
    #[arg(long, default_value = "127.0.0.1")]
    client: IpAddr,

    /// Client RTP port (RTCP uses the next one)
    #[arg(long, default_value_t = 5000)]
    client_port: u16,

    /// Payload types to accept
    #[arg(long = "payload-type", short = 'p', default_values_t = [96u8])]
    payload_types: Vec<u8>,

    /// Clock rate of the payload types
    #[arg(long, default_value_t = 90000)]
    clock_rate: u32,

    /// Write queue capacity
    #[arg(long, default_value_t = 256)]
    queue_size: usize,

    /// TCP write timeout in seconds
    #[arg(long, default_value_t = 10)]
    write_timeout: u64,
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let config = ServerConfig {
        udp_rtp_address: Some(args.rtp),
        udp_rtcp_address: Some(SocketAddr::new(args.rtp.ip(), args.rtp.port().wrapping_add(1))),
        write_queue_size: args.queue_size,
        write_timeout: Duration::from_secs(args.write_timeout),
        ..ServerConfig::default()
    };

    let server = Arc::new(Server::with_config(config));
    if let Err(e) = server.start() {
        eprintln!("Failed to start server: {}", e);
        return;
    }

    let session = match ServerSession::builder(
        server.clone(),
        args.client,
        Direction::Record,
        Transport::UdpUnicast,
    )
    .on_decode_error(|e| tracing::warn!(error = %e, "dropped packet"))
    .on_write_error(|e| tracing::error!(error = %e, "write failed"))
    .build()
    {
        Ok(session) => session,
        Err(e) => {
            eprintln!("Failed to create session: {}", e);
            server.stop();
            return;
        }
    };

    let formats = args
        .payload_types
        .iter()
        .map(|&pt| Format::new(pt, "unknown", args.clock_rate))
        .collect();
    let media = Arc::new(Media::new(MediaKind::Video, "trackID=0", formats));
    let setup = MediaSetup::udp(args.client, args.client_port, args.client_port.wrapping_add(1));

    let media = match SessionMedia::new(session.context(), media, setup) {
        Ok(media) => media
            .on_packet_rtp(|format, packet| {
                tracing::info!(
                    payload_type = format.payload_type(),
                    ssrc = packet.ssrc(),
                    seq = packet.sequence_number(),
                    len = packet.payload().len(),
                    "RTP"
                );
            })
            .on_packet_rtcp(|packet| tracing::info!(kind = rtcp_packet_kind(packet), "RTCP")),
        Err(e) => {
            eprintln!("Invalid media setup: {}", e);
            server.stop();
            return;
        }
    };
    session.add_media(media);

    if let Err(e) = session.start() {
        eprintln!("Failed to start session: {}", e);
        server.stop();
        return;
    }

    println!(
        "Receiving from {}:{} on {}, press Enter to stop",
        args.client, args.client_port, args.rtp
    );
    let mut input = String::new();
    let _ = io::stdin().read_line(&mut input);

    session.stop();
    println!(
        "{} bytes received, {} bytes sent",
        session.stats().bytes_received(),
        session.stats().bytes_sent()
    );
    server.stop();
}
