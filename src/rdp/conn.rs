use crate::rdp::{
    defs::{RdpConfig, RdpStatus},
    packet::RDP_EACK_MAX,
    seq::{distance, seq_in_range, seq_less_equal},
    timer::RdpTimer,
};
use crate::types::PeerId;
use anyhow::Result;
use std::cmp::min;
use std::collections::VecDeque;
use std::fmt::{self, Display};

// (peer, peer's port, our port) of one protocol connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RdpAddr {
    pub did: PeerId, // destination id
    pub dport: u16,  // destination port
    pub sport: u16,  // source port
}

impl Display for RdpAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{} (local {})", self.did, self.dport, self.sport)
    }
}

#[derive(Debug)]
pub struct RdpConnection {
    pub addr: Option<RdpAddr>, // None while only listening
    pub local_port: u16,
    pub status: RdpStatus,
    pub parent_id: Option<usize>, // listening descriptor of a passive open
    pub sequenced: bool,
    pub send_vars: SendVariables,
    pub recv_vars: ReceiveVariables,
    pub send_queue: SendQueue,
    pub recv_queue: ReceiveQueue,
    pub timer: RdpTimer,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReceiveOutcome {
    InOrder(usize), // number of segments that became deliverable
    OutOfOrder,
    Duplicate,
    OutOfWindow,
}

impl RdpConnection {
    pub fn new_listen(local_port: u16, config: &RdpConfig) -> Self {
        let mut conn = Self::new(None, local_port, config);
        conn.status = RdpStatus::Listen;
        conn
    }

    pub fn new_active(addr: RdpAddr, config: &RdpConfig, iss: u32) -> Self {
        let mut conn = Self::new(Some(addr), addr.sport, config);
        conn.status = RdpStatus::SynSent;
        conn.send_vars.set_initial_sequence(iss);
        conn
    }

    pub fn new_passive(addr: RdpAddr, parent_id: usize, config: &RdpConfig, iss: u32) -> Self {
        let mut conn = Self::new(Some(addr), addr.sport, config);
        conn.status = RdpStatus::SynRcvd;
        conn.parent_id = Some(parent_id);
        conn.send_vars.set_initial_sequence(iss);
        conn
    }

    fn new(addr: Option<RdpAddr>, local_port: u16, config: &RdpConfig) -> Self {
        Self {
            addr,
            local_port,
            status: RdpStatus::Closed,
            parent_id: None,
            sequenced: config.sequenced,
            send_vars: SendVariables {
                max_outstanding: config.snd_max.max(1),
                sbuf_max: config.rbuf_max.max(1),
                ..Default::default()
            },
            recv_vars: ReceiveVariables {
                max_segments: config.rcv_max.clamp(1, RDP_EACK_MAX as u32 + 1),
                rbuf_max: config.rbuf_max.max(1),
                ..Default::default()
            },
            send_queue: SendQueue::new(),
            recv_queue: ReceiveQueue::new(),
            timer: RdpTimer::new(),
        }
    }

    pub fn remote(&self) -> Result<&RdpAddr> {
        match &self.addr {
            Some(addr) => Ok(addr),
            None => anyhow::bail!("Connection on local port {} has no remote peer.", self.local_port),
        }
    }

    pub fn print_address(&self) -> String {
        match &self.addr {
            Some(addr) => format!("local={} remote={}:{}", self.local_port, addr.did, addr.dport),
            None => format!("local={} remote=*", self.local_port),
        }
    }

    pub fn print_log_prefix(&self, id: usize) -> String {
        format!("id={} status={} {}", id, self.status, self.print_address())
    }

    // Limits announced by the peer's SYN. Both sides end up with the same
    // segment size because each takes the smaller of the two rbuf_max.
    // A segment carries at least one byte.
    pub fn negotiate(&mut self, seg_max: u16, seg_bmax: u16, peer_sequenced: bool, config: &RdpConfig) {
        self.send_vars.max_outstanding = min(config.snd_max, seg_max as u32).max(1);
        self.send_vars.sbuf_max = min(self.recv_vars.rbuf_max, seg_bmax as u32).max(1);
        self.sequenced = config.sequenced && peer_sequenced;
    }

    pub fn outstanding(&self) -> u32 {
        distance(self.send_vars.unacknowledged, self.send_vars.next_sequence_num)
    }

    pub fn can_send(&self) -> bool {
        self.outstanding() < self.send_vars.max_outstanding
    }

    // Takes the next sequence number and queues the segment for (re)transmission.
    pub fn enqueue_segment(&mut self, payload: Vec<u8>, nul: bool) -> u32 {
        let seq = self.send_vars.next_sequence_num;
        self.send_vars.next_sequence_num = seq.wrapping_add(1);
        self.send_queue.segments.push_back(SendSegment { seq, payload, nul });
        seq
    }

    // If SND.UNA =< SEG.ACK < SND.NXT, flush acknowledged segments and set SND.UNA <- SEG.ACK + 1.
    pub fn update_snd_una(&mut self, seg_ack: u32) -> bool {
        let una = self.send_vars.unacknowledged;
        let nxt = self.send_vars.next_sequence_num;
        if una == nxt || !seq_in_range(una, nxt.wrapping_sub(1), seg_ack) {
            return false;
        }
        self.send_queue
            .segments
            .retain(|segment| !seq_less_equal(segment.seq, seg_ack));
        self.send_vars.unacknowledged = seg_ack.wrapping_add(1);
        true
    }

    // Drops segments the peer reported as received out of sequence. Returns how many were dropped.
    pub fn apply_eack(&mut self, eacks: &[u32]) -> usize {
        let before = self.send_queue.segments.len();
        self.send_queue
            .segments
            .retain(|segment| !eacks.contains(&segment.seq));
        before - self.send_queue.segments.len()
    }

    pub fn add_segment(&mut self, seq: u32, payload: &[u8]) -> ReceiveOutcome {
        let current = self.recv_vars.current_sequence_num;
        if seq_less_equal(seq, current) || self.recv_queue.contains(seq) {
            return ReceiveOutcome::Duplicate;
        }
        if !seq_in_range(
            current.wrapping_add(1),
            current.wrapping_add(self.recv_vars.max_segments),
            seq,
        ) {
            return ReceiveOutcome::OutOfWindow;
        }
        if seq == current.wrapping_add(1) {
            self.recv_queue.ready.extend(payload);
            self.recv_vars.current_sequence_num = seq;
            let mut delivered = 1;
            while let Some(next) = self.recv_queue.pop_next(self.recv_vars.current_sequence_num) {
                if !next.delivered {
                    self.recv_queue.ready.extend(next.payload);
                }
                self.recv_vars.current_sequence_num = next.seq;
                delivered += 1;
            }
            ReceiveOutcome::InOrder(delivered)
        } else {
            let delivered = !self.sequenced;
            let held = if delivered {
                self.recv_queue.ready.extend(payload);
                Vec::new()
            } else {
                payload.to_vec()
            };
            self.recv_queue.insert(
                current,
                ReceiveSegment {
                    seq,
                    payload: held,
                    delivered,
                },
            );
            ReceiveOutcome::OutOfOrder
        }
    }

    pub fn eack_list(&self) -> Vec<u32> {
        self.recv_queue
            .rcvdsendq
            .iter()
            .take(RDP_EACK_MAX)
            .map(|segment| segment.seq)
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct SendVariables {
    pub next_sequence_num: u32,    // SND.NXT
    pub unacknowledged: u32,       // SND.UNA
    pub max_outstanding: u32,      // SND.MAX
    pub initial_sequence_num: u32, // SND.ISS
    pub sbuf_max: u32,             // largest payload we may send, agreed in the SYN exchange
}

impl SendVariables {
    fn set_initial_sequence(&mut self, iss: u32) {
        self.initial_sequence_num = iss;
        self.unacknowledged = iss;
        self.next_sequence_num = iss.wrapping_add(1);
    }
}

#[derive(Debug, Default)]
pub struct ReceiveVariables {
    pub current_sequence_num: u32, // RCV.CUR
    pub max_segments: u32,         // RCV.MAX
    pub initial_sequence_num: u32, // RCV.IRS
    pub rbuf_max: u32,             // largest payload we accept, sent in our SYN
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendSegment {
    pub seq: u32,
    pub payload: Vec<u8>,
    pub nul: bool,
}

#[derive(Debug, Default)]
pub struct SendQueue {
    pub segments: VecDeque<SendSegment>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceiveSegment {
    pub seq: u32,
    pub payload: Vec<u8>,
    pub delivered: bool, // payload already handed over (unsequenced delivery)
}

#[derive(Debug, Default, PartialEq)]
pub struct ReceiveQueue {
    pub ready: VecDeque<u8>,
    pub rcvdsendq: Vec<ReceiveSegment>, // out of sequence, ordered by distance from RCV.CUR
}

impl ReceiveQueue {
    pub fn new() -> Self {
        Self {
            ..Default::default()
        }
    }

    pub fn contains(&self, seq: u32) -> bool {
        self.rcvdsendq.iter().any(|segment| segment.seq == seq)
    }

    fn insert(&mut self, current: u32, segment: ReceiveSegment) {
        let position = self
            .rcvdsendq
            .iter()
            .position(|held| distance(current, held.seq) > distance(current, segment.seq))
            .unwrap_or(self.rcvdsendq.len());
        self.rcvdsendq.insert(position, segment);
    }

    fn pop_next(&mut self, current: u32) -> Option<ReceiveSegment> {
        match self.rcvdsendq.first() {
            Some(held) if held.seq == current.wrapping_add(1) => Some(self.rcvdsendq.remove(0)),
            _ => None,
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let len = min(buf.len(), self.ready.len());
        for (dst, src) in buf.iter_mut().zip(self.ready.drain(..len)) {
            *dst = src;
        }
        len
    }
}
