use std::fmt::{self, Display};
use std::time::Duration;
use thiserror::Error;

pub const RDP_VERSION: u8 = 2;
// Largest payload (octets) we are willing to receive in one segment.
pub const RDP_RBUF_MAX_DEFAULT: u32 = 1024;
// Max number of unacknowledged segments in flight.
pub const RDP_SND_MAX_DEFAULT: u32 = 32;
// Max number of segments buffered on the receive side.
pub const RDP_RCV_MAX_DEFAULT: u32 = 32;
// Ports up to this value are reserved for listeners, ephemeral ports start above it.
pub const RDP_WELL_KNOWN_PORT_MAX: u16 = 1024;
pub const RDP_CLOSE_WAIT_DEFAULT: Duration = Duration::from_secs(10);
pub const RDP_REXMT_INIT_DEFAULT: Duration = Duration::from_millis(500);
pub const RDP_MAX_LISTEN_QUEUE_DEFAULT: usize = 16;
pub const RDP_MAX_CONNECTIONS: usize = 1024;

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum RdpStatus {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Open,
    CloseWait,
}

impl Display for RdpStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RdpStatus::Closed => write!(f, "CLOSED"),
            RdpStatus::Listen => write!(f, "LISTEN"),
            RdpStatus::SynSent => write!(f, "SYN-SENT"),
            RdpStatus::SynRcvd => write!(f, "SYN-RCVD"),
            RdpStatus::Open => write!(f, "OPEN"),
            RdpStatus::CloseWait => write!(f, "CLOSE-WAIT"),
        }
    }
}

// Result of a send call. Backpressure is flow control, not a failure.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum SendStatus {
    Accepted(usize),
    Backpressure,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RdpError {
    #[error("Descriptor {desc} was never opened.")]
    UnknownDescriptor { desc: usize },
    #[error("Connection for descriptor {desc} is closed.")]
    ConnectionClosed { desc: usize },
    #[error("Operation {operation} is not allowed for descriptor {desc} in status {status}.")]
    InvalidState {
        desc: usize,
        operation: &'static str,
        status: RdpStatus,
    },
    #[error("Port {port} is already listening.")]
    PortInUse { port: u16 },
    #[error("Connection to {peer}:{dport} from local port {sport} already exists.")]
    AddressInUse { peer: String, dport: u16, sport: u16 },
    #[error("No free descriptor. RDP_MAX_CONNECTIONS={max}")]
    NoDescriptor { max: usize },
    #[error("No free ephemeral port for {peer}:{dport}.")]
    NoEphemeralPort { peer: String, dport: u16 },
}

#[derive(Clone, Debug)]
pub struct RdpConfig {
    pub rbuf_max: u32,
    pub snd_max: u32,
    pub rcv_max: u32,
    pub sequenced: bool,
    pub close_wait: Duration,
    pub rexmt_init: Duration,
    pub max_listen_queue: usize,
    pub iss: Option<u32>, // fixed initial sequence number, random when None
}

impl Default for RdpConfig {
    fn default() -> Self {
        Self {
            rbuf_max: RDP_RBUF_MAX_DEFAULT,
            snd_max: RDP_SND_MAX_DEFAULT,
            rcv_max: RDP_RCV_MAX_DEFAULT,
            sequenced: true,
            close_wait: RDP_CLOSE_WAIT_DEFAULT,
            rexmt_init: RDP_REXMT_INIT_DEFAULT,
            max_listen_queue: RDP_MAX_LISTEN_QUEUE_DEFAULT,
            iss: None,
        }
    }
}
