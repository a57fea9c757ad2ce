use anyhow::{Context, Result};
use clap::Parser;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use rdp_r::{
    rdp::{
        defs::{RdpConfig, RdpStatus, SendStatus},
        usrreq::RdpStack,
    },
    types::PeerId,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::str::from_utf8;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(version, about = "Runs two rdp stacks against each other over an in-memory lossy link.", long_about = None)]
#[command(after_help = "EXAMPLES: ./rdp_r -c 20 --loss 0.2 --reorder")]
struct Args {
    #[arg(long, short = 'p', help = "Listening port of the server stack", default_value_t = 80)]
    port: u16,

    #[arg(long, short = 'c', help = "Number of messages the client sends", default_value_t = 10)]
    count: usize,

    #[arg(long, help = "Probability of dropping a datagram, 0.0 - 1.0", default_value_t = 0.0)]
    loss: f64,

    #[arg(long, help = "Shuffle datagrams in flight on every tick")]
    reorder: bool,

    #[arg(long, help = "Seed for loss and reordering", default_value_t = 1)]
    seed: u64,

    #[arg(long, help = "Max payload octets per segment", default_value_t = 1024)]
    rbuf_max: u32,

    #[arg(long, help = "Max outstanding segments", default_value_t = 8)]
    snd_max: u32,

    #[arg(long, help = "Disable sequenced delivery")]
    unsequenced: bool,

    #[arg(long, help = "Initial retransmission timeout in msec", default_value_t = 50)]
    rexmt_ms: u64,

    #[arg(long, help = "CLOSE-WAIT duration in msec", default_value_t = 200)]
    close_wait_ms: u64,

    #[arg(long, help = "Give up after this many seconds", default_value_t = 10)]
    timeout: u64,
}

impl Args {
    fn rdp_config(&self) -> RdpConfig {
        RdpConfig {
            rbuf_max: self.rbuf_max,
            snd_max: self.snd_max,
            sequenced: !self.unsequenced,
            rexmt_init: Duration::from_millis(self.rexmt_ms),
            close_wait: Duration::from_millis(self.close_wait_ms),
            ..Default::default()
        }
    }
}

// Datagram in flight: (source, destination, bytes).
type Wire = Rc<RefCell<VecDeque<(PeerId, PeerId, Vec<u8>)>>>;

fn attach(stack: &mut RdpStack, id: PeerId, wire: &Wire) {
    let wire = wire.clone();
    stack.set_callback_output(move |dst: &PeerId, buf: &[u8]| {
        wire.borrow_mut().push_back((id, *dst, buf.to_vec()));
    });
}

fn print_payload(data: &[u8]) {
    let ascii = from_utf8(data)
        .map(|v| v.to_string())
        .unwrap_or_else(|_| String::from("Data contains non-ASCII characters"));
    println!("Rdp data received ({} bytes).", data.len());
    println!("hex: {}\nascii: {}", hex::encode(data), ascii);
}

fn main() -> Result<()> {
    env_logger::builder().format_timestamp_millis().init();
    let args = Args::parse();
    let mut rng = StdRng::seed_from_u64(args.seed);
    let wire: Wire = Rc::new(RefCell::new(VecDeque::new()));

    let server_id = PeerId::random();
    let client_id = PeerId::random();
    let mut server = RdpStack::new(args.rdp_config());
    let mut client = RdpStack::new(args.rdp_config());
    attach(&mut server, server_id, &wire);
    attach(&mut client, client_id, &wire);

    let listen = server.listen(args.port).context("Failed to listen.")?;
    let conn = client
        .connect(0, server_id, args.port)
        .context("Failed to connect.")?;
    println!("Client connecting to {}:{}.", server_id, args.port);

    let mut accepted = None;
    let mut sent = 0;
    let mut expected = 0;
    let mut received = 0;
    let mut buf = [0; 2048];
    let deadline = Instant::now() + Duration::from_secs(args.timeout);

    while Instant::now() < deadline {
        let mut in_flight: Vec<_> = wire.borrow_mut().drain(..).collect();
        if args.reorder {
            in_flight.shuffle(&mut rng);
        }
        for (src, dst, bytes) in in_flight {
            if rng.gen_bool(args.loss.clamp(0.0, 1.0)) {
                log::debug!("Dropped {} bytes from {}.", bytes.len(), src);
                continue;
            }
            if dst == server_id {
                server.input_dgram(&src, &bytes);
            } else if dst == client_id {
                client.input_dgram(&src, &bytes);
            }
        }

        if accepted.is_none() {
            accepted = server.accept(listen)?;
            if let Some(id) = accepted {
                println!("Socket accepted! id={}", id);
            }
        }
        if let Some(id) = accepted {
            loop {
                let amt = server.receive(id, &mut buf)?;
                if amt == 0 {
                    break;
                }
                received += amt;
                print_payload(&buf[..amt]);
            }
        }

        if client.status(conn) == RdpStatus::Open && sent < args.count {
            let message = format!("message {}", sent);
            match client.send(conn, message.as_bytes())? {
                SendStatus::Accepted(amt) => {
                    sent += 1;
                    expected += amt;
                }
                SendStatus::Backpressure => log::debug!("Client send window is full."),
            }
        }
        if sent == args.count && received == expected && client.status(conn) == RdpStatus::Open {
            println!("All {} messages delivered ({} bytes). Closing.", sent, received);
            client.close(conn)?;
        }
        if client.status(conn) == RdpStatus::Closed {
            // The RST may have been lost on the way.
            let server_status = accepted.map_or(RdpStatus::Closed, |id| server.status(id));
            println!("Client closed. server={}", server_status);
            return Ok(());
        }

        server.timer_handler();
        client.timer_handler();
        thread::sleep(Duration::from_millis(5));
    }
    anyhow::bail!(
        "Timed out. sent={} received={} client={} server={}",
        sent,
        received,
        client.status(conn),
        accepted.map_or(RdpStatus::Closed, |id| server.status(id))
    )
}
