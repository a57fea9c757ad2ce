use crate::rdp::{
    conn::{RdpAddr, RdpConnection, ReceiveOutcome},
    defs::RdpStatus,
    packet::{RdpFlag, RdpSegment, RdpSegmentType, SynOption},
    usrreq::RdpStack,
};
use crate::types::PeerId;
use anyhow::{Context, Result};
use std::time::Instant;

// Copied out of the segment currently being processed. Never stored on the connection.
#[derive(Debug, Default)]
struct SegmentVariables {
    seq: u32,   // SEG.SEQ
    ack: u32,   // SEG.ACK
    max: u16,   // SEG.MAX, peer's max outstanding segments (SYN only)
    bmax: u16,  // SEG.BMAX, peer's max segment size (SYN only)
    sequenced: bool,
}

impl SegmentVariables {
    fn new(segment: &RdpSegment) -> Self {
        let mut vars = Self {
            seq: segment.seq_number,
            ack: segment.ack_number,
            ..Default::default()
        };
        if let RdpSegmentType::Syn(params) = &segment.segment_type {
            vars.max = params.max_outstanding;
            vars.bmax = params.max_segment_size;
            vars.sequenced = params.options.contains(SynOption::SEQUENCED);
        }
        vars
    }
}

impl RdpStack {
    // Entry point for the overlay. Never fails towards the caller: anything
    // that cannot be decoded or handled is logged and dropped.
    pub fn input_dgram(&mut self, src: &PeerId, buf: &[u8]) {
        let mut segment = RdpSegment::new();
        if let Err(e) = segment.read(buf) {
            log::debug!(
                "Discarding invalid rdp segment from {} ({} bytes). Err: {:?}",
                src,
                buf.len(),
                e
            );
            return;
        }
        if let Err(e) = self.recv_handler(src, &segment) {
            log::warn!("Failed to handle rdp segment from {}. Err: {:?}", src, e);
        }
    }

    pub fn recv_handler(&mut self, src: &PeerId, segment: &RdpSegment) -> Result<()> {
        // The sender's source port is our destination port and vice versa.
        let addr = RdpAddr {
            did: *src,
            dport: segment.src_port,
            sport: segment.dst_port,
        };
        if let Some(id) = self.table.lookup_by_addr(&addr) {
            let Some(conn) = self.table.lookup_by_descriptor(id) else {
                anyhow::bail!("No RdpConnection for the descriptor (id={}) bound to {}.", id, addr);
            };
            let status = conn.status;
            log::trace!(
                "[{}] Handling segment. {}",
                conn.print_log_prefix(id),
                segment.print_general_info()
            );
            match status {
                RdpStatus::SynSent => self
                    .recv_handler_syn_sent(id, segment)
                    .context("recv_handler_syn_sent failed.")?,
                RdpStatus::SynRcvd => self
                    .recv_handler_syn_rcvd(id, segment)
                    .context("recv_handler_syn_rcvd failed.")?,
                RdpStatus::Open => self
                    .recv_handler_open(id, segment)
                    .context("recv_handler_open failed.")?,
                RdpStatus::CloseWait => self
                    .recv_handler_close_wait(id, segment)
                    .context("recv_handler_close_wait failed.")?,
                other => {
                    anyhow::bail!("Recv handler for RdpStatus {} is not implemented.", other);
                }
            }
            return Ok(());
        }
        if let Some(id) = self.table.lookup_listen(segment.dst_port) {
            return self
                .recv_handler_listen(id, addr, segment)
                .context("recv_handler_listen failed.");
        }
        log::debug!(
            "No connection bound for the segment from {}:{} to port {}, dropped. {}",
            src,
            segment.src_port,
            segment.dst_port,
            segment.print_general_info()
        );
        Ok(())
    }

    fn recv_handler_listen(&mut self, listen_id: usize, addr: RdpAddr, segment: &RdpSegment) -> Result<()> {
        if segment.flag.contains(RdpFlag::RST) {
            log::debug!("LISTEN socket (id={}) ignores rst segment from {}.", listen_id, addr);
            return Ok(());
        }
        if segment.flag.contains(RdpFlag::ACK) || !segment.flag.contains(RdpFlag::SYN) {
            log::debug!(
                "LISTEN socket (id={}) ignores a segment that is not a bare SYN. remote={} FLAG={:?}",
                listen_id,
                addr,
                segment.flag
            );
            return Ok(());
        }
        let queued = self.table.listen_queue_len(listen_id).unwrap_or(0);
        if queued >= self.config.max_listen_queue {
            log::debug!(
                "LISTEN socket (id={}) has no room for {}. queue: {}/{}",
                listen_id,
                addr,
                queued,
                self.config.max_listen_queue
            );
            return Ok(());
        }
        let seg = SegmentVariables::new(segment);
        let iss = self.generate_initial_sequence();
        let mut new_conn = RdpConnection::new_passive(addr, listen_id, &self.config, iss);
        new_conn.recv_vars.current_sequence_num = seg.seq;
        new_conn.recv_vars.initial_sequence_num = seg.seq;
        new_conn.negotiate(seg.max, seg.bmax, seg.sequenced, &self.config);
        let id = self.table.bind_passive(listen_id, new_conn)?;
        let Some(conn) = self.table.get_mut(id) else {
            anyhow::bail!("Cannot find the passive connection (id={}) just created.", id);
        };
        self.sink
            .send_handler(conn)
            .context("Failed to send SYN/ACK for passive open.")?;
        conn.timer.retransmission.fire(Instant::now(), self.config.rexmt_init);
        log::debug!(
            "[{}] Status changed from LISTEN to SYN-RCVD (listen id={}). ISS={} IRS={} SND.MAX={} SBUF.MAX={}",
            conn.print_log_prefix(id),
            listen_id,
            iss,
            seg.seq,
            conn.send_vars.max_outstanding,
            conn.send_vars.sbuf_max
        );
        Ok(())
    }

    fn recv_handler_syn_sent(&mut self, socket_id: usize, segment: &RdpSegment) -> Result<()> {
        if segment.flag.contains(RdpFlag::RST) {
            return self.reset_connection(socket_id);
        }
        let Some(conn) = self.table.get_mut(socket_id) else {
            anyhow::bail!("Cannot find connection (id={}).", socket_id);
        };
        if !matches!(segment.segment_type, RdpSegmentType::Syn(_)) {
            log::debug!(
                "[{}] SYN-SENT socket ignores a segment without SYN. {}",
                conn.print_log_prefix(socket_id),
                segment.print_general_info()
            );
            return Ok(());
        }
        let seg = SegmentVariables::new(segment);
        if segment.flag.contains(RdpFlag::ACK) {
            if seg.ack != conn.send_vars.initial_sequence_num {
                log::debug!(
                    "[{}] SYN/ACK acknowledges {} but ISS is {}, dropped.",
                    conn.print_log_prefix(socket_id),
                    seg.ack,
                    conn.send_vars.initial_sequence_num
                );
                return Ok(());
            }
            conn.recv_vars.current_sequence_num = seg.seq;
            conn.recv_vars.initial_sequence_num = seg.seq;
            conn.send_vars.unacknowledged = seg.ack.wrapping_add(1);
            conn.negotiate(seg.max, seg.bmax, seg.sequenced, &self.config);
            conn.status = RdpStatus::Open;
            conn.timer.retransmission.init();
            log::debug!(
                "[{}] Status changed from SYN-SENT to OPEN. IRS={} SND.MAX={} SBUF.MAX={} sequenced={}",
                conn.print_log_prefix(socket_id),
                seg.seq,
                conn.send_vars.max_outstanding,
                conn.send_vars.sbuf_max,
                conn.sequenced
            );
            self.sink.send_ack(conn).context("Failed to ACK the SYN/ACK.")?;
        } else {
            // simultaneous open
            conn.recv_vars.current_sequence_num = seg.seq;
            conn.recv_vars.initial_sequence_num = seg.seq;
            conn.negotiate(seg.max, seg.bmax, seg.sequenced, &self.config);
            conn.status = RdpStatus::SynRcvd;
            log::debug!(
                "[{}] Status changed from SYN-SENT to SYN-RCVD. IRS={}",
                conn.print_log_prefix(socket_id),
                seg.seq
            );
            self.sink
                .send_handler(conn)
                .context("Failed to send SYN/ACK for simultaneous open.")?;
            conn.timer.retransmission.fire(Instant::now(), self.config.rexmt_init);
        }
        Ok(())
    }

    fn recv_handler_syn_rcvd(&mut self, socket_id: usize, segment: &RdpSegment) -> Result<()> {
        if segment.flag.contains(RdpFlag::RST) {
            return self.reset_connection(socket_id);
        }
        let Some(conn) = self.table.get_mut(socket_id) else {
            anyhow::bail!("Cannot find connection (id={}).", socket_id);
        };
        let seg = SegmentVariables::new(segment);
        let has_ack = segment.flag.contains(RdpFlag::ACK);
        if let RdpSegmentType::Syn(_) = segment.segment_type {
            if has_ack && seg.ack == conn.send_vars.initial_sequence_num {
                // The other half of a simultaneous open.
                conn.send_vars.unacknowledged = seg.ack.wrapping_add(1);
                conn.status = RdpStatus::Open;
                conn.timer.retransmission.init();
                log::debug!(
                    "[{}] Status changed from SYN-RCVD to OPEN by SYN/ACK.",
                    conn.print_log_prefix(socket_id)
                );
                self.sink.send_ack(conn).context("Failed to ACK the SYN/ACK.")?;
                self.table.mark_established(socket_id);
            } else if !has_ack && seg.seq == conn.recv_vars.initial_sequence_num {
                log::debug!(
                    "[{}] Duplicate SYN, resending SYN/ACK.",
                    conn.print_log_prefix(socket_id)
                );
                self.sink.send_handler(conn).context("Failed to resend SYN/ACK.")?;
            } else {
                log::debug!(
                    "[{}] Unexpected SYN, dropped. {}",
                    conn.print_log_prefix(socket_id),
                    segment.print_general_info()
                );
            }
            return Ok(());
        }
        if !has_ack || seg.ack != conn.send_vars.initial_sequence_num {
            log::debug!(
                "[{}] SYN-RCVD socket needs an ACK of ISS={}, dropped. {}",
                conn.print_log_prefix(socket_id),
                conn.send_vars.initial_sequence_num,
                segment.print_general_info()
            );
            return Ok(());
        }
        conn.send_vars.unacknowledged = seg.ack.wrapping_add(1);
        conn.status = RdpStatus::Open;
        conn.timer.retransmission.init();
        log::debug!(
            "[{}] Status changed from SYN-RCVD to OPEN.",
            conn.print_log_prefix(socket_id)
        );
        self.table.mark_established(socket_id);
        // The handshake ACK may already carry data or an EACK.
        if segment.consumes_sequence() || matches!(segment.segment_type, RdpSegmentType::Eack(_)) {
            self.recv_handler_open(socket_id, segment)?;
        }
        Ok(())
    }

    fn recv_handler_open(&mut self, socket_id: usize, segment: &RdpSegment) -> Result<()> {
        if segment.flag.contains(RdpFlag::RST) {
            return self.reset_connection(socket_id);
        }
        let Some(conn) = self.table.get_mut(socket_id) else {
            anyhow::bail!("Cannot find connection (id={}).", socket_id);
        };
        let seg = SegmentVariables::new(segment);
        if let RdpSegmentType::Syn(_) = segment.segment_type {
            // A retransmitted SYN/ACK means our handshake ACK was lost.
            if segment.flag.contains(RdpFlag::ACK) && seg.seq == conn.recv_vars.initial_sequence_num {
                log::debug!(
                    "[{}] Duplicate SYN/ACK, acknowledging again.",
                    conn.print_log_prefix(socket_id)
                );
                self.sink.send_ack(conn).context("Failed to re-ACK the SYN/ACK.")?;
            } else {
                log::debug!(
                    "[{}] OPEN socket discards SYN. {}",
                    conn.print_log_prefix(socket_id),
                    segment.print_general_info()
                );
            }
            return Ok(());
        }
        if segment.payload.len() > conn.recv_vars.rbuf_max as usize {
            log::debug!(
                "[{}] Segment payload {} exceeds RBUF.MAX={}, dropped.",
                conn.print_log_prefix(socket_id),
                segment.payload.len(),
                conn.recv_vars.rbuf_max
            );
            return Ok(());
        }

        if segment.flag.contains(RdpFlag::ACK) {
            let advanced = conn.update_snd_una(seg.ack);
            let eacked = match &segment.segment_type {
                RdpSegmentType::Eack(eacks) => conn.apply_eack(eacks),
                _ => 0,
            };
            if advanced || eacked > 0 {
                log::trace!(
                    "[{}] SND.UNA={} SND.NXT={} eacked={} queued={}",
                    conn.print_log_prefix(socket_id),
                    conn.send_vars.unacknowledged,
                    conn.send_vars.next_sequence_num,
                    eacked,
                    conn.send_queue.segments.len()
                );
            }
            if conn.send_queue.segments.is_empty() {
                conn.timer.retransmission.init();
            } else if advanced {
                conn.timer.retransmission.fire(Instant::now(), self.config.rexmt_init);
            }
        }

        if !segment.consumes_sequence() {
            return Ok(());
        }
        match conn.add_segment(seg.seq, &segment.payload) {
            ReceiveOutcome::InOrder(delivered) => log::trace!(
                "[{}] Accepted SEQ={}, {} segments deliverable. RCV.CUR={}",
                conn.print_log_prefix(socket_id),
                seg.seq,
                delivered,
                conn.recv_vars.current_sequence_num
            ),
            ReceiveOutcome::OutOfOrder => log::debug!(
                "[{}] Holding out of sequence SEQ={}. RCV.CUR={} held={}",
                conn.print_log_prefix(socket_id),
                seg.seq,
                conn.recv_vars.current_sequence_num,
                conn.recv_queue.rcvdsendq.len()
            ),
            ReceiveOutcome::Duplicate => log::debug!(
                "[{}] Duplicate SEQ={}, acknowledging again. RCV.CUR={}",
                conn.print_log_prefix(socket_id),
                seg.seq,
                conn.recv_vars.current_sequence_num
            ),
            ReceiveOutcome::OutOfWindow => {
                log::debug!(
                    "[{}] SEQ={} is outside the receive window (RCV.CUR={} RCV.MAX={}), dropped.",
                    conn.print_log_prefix(socket_id),
                    seg.seq,
                    conn.recv_vars.current_sequence_num,
                    conn.recv_vars.max_segments
                );
                return Ok(());
            }
        }
        self.sink.send_ack(conn).context("Failed to acknowledge the segment.")
    }

    fn recv_handler_close_wait(&mut self, socket_id: usize, segment: &RdpSegment) -> Result<()> {
        if segment.flag.contains(RdpFlag::RST) {
            return self.reset_connection(socket_id);
        }
        log::trace!(
            "CLOSE-WAIT socket (id={}) discards segment. {}",
            socket_id,
            segment.print_general_info()
        );
        Ok(())
    }

    fn reset_connection(&mut self, socket_id: usize) -> Result<()> {
        let Some(mut conn) = self.table.remove(socket_id) else {
            anyhow::bail!("Cannot find connection (id={}).", socket_id);
        };
        let previous = conn.status;
        conn.status = RdpStatus::Closed;
        log::debug!(
            "[{}] Status changed from {} to CLOSED by RST.",
            conn.print_log_prefix(socket_id),
            previous
        );
        Ok(())
    }
}

#[cfg(test)]
mod input_tests {
    use super::*;
    use crate::rdp::{
        defs::RdpConfig,
        packet::SynParams,
    };
    use std::cell::RefCell;
    use std::rc::Rc;

    type Captured = Rc<RefCell<Vec<(PeerId, Vec<u8>)>>>;

    const PEER: [u8; 20] = [7; 20];

    fn setup_listener() -> (RdpStack, usize, Captured) {
        let config = RdpConfig {
            iss: Some(5000),
            ..Default::default()
        };
        let mut stack = RdpStack::new(config);
        let captured: Captured = Rc::new(RefCell::new(Vec::new()));
        let sink = captured.clone();
        stack.set_callback_output(move |dst: &PeerId, buf: &[u8]| {
            sink.borrow_mut().push((*dst, buf.to_vec()));
        });
        let listen = stack.listen(80).unwrap();
        (stack, listen, captured)
    }

    fn syn(seq: u32) -> Vec<u8> {
        let mut segment = RdpSegment::new();
        segment.src_port = 2000;
        segment.dst_port = 80;
        segment.seq_number = seq;
        segment.segment_type = RdpSegmentType::Syn(SynParams {
            max_outstanding: 4,
            max_segment_size: 512,
            options: SynOption::SEQUENCED,
        });
        segment.create_packet()
    }

    fn segment(flag: RdpFlag, seq: u32, ack: u32, payload: &[u8]) -> Vec<u8> {
        let mut segment = RdpSegment::new();
        segment.flag = flag;
        segment.src_port = 2000;
        segment.dst_port = 80;
        segment.seq_number = seq;
        segment.ack_number = ack;
        segment.payload = payload.to_vec();
        if flag.contains(RdpFlag::RST) {
            segment.segment_type = RdpSegmentType::Rst;
        }
        segment.create_packet()
    }

    fn decode(buf: &[u8]) -> RdpSegment {
        let mut segment = RdpSegment::new();
        segment.read(buf).unwrap();
        segment
    }

    fn passive_id(stack: &RdpStack) -> usize {
        stack
            .table
            .lookup_by_addr(&RdpAddr {
                did: PeerId::new(PEER),
                dport: 2000,
                sport: 80,
            })
            .unwrap()
    }

    #[test]
    fn test_listen_answers_syn_with_syn_ack() {
        let (mut stack, _listen, captured) = setup_listener();
        stack.input_dgram(&PeerId::new(PEER), &syn(100));
        let id = passive_id(&stack);
        let conn = stack.connection(id).unwrap();
        assert_eq!(conn.status, RdpStatus::SynRcvd);
        assert_eq!(conn.recv_vars.current_sequence_num, 100);
        assert_eq!(conn.send_vars.sbuf_max, 512);
        assert_eq!(conn.send_vars.max_outstanding, 4);
        let sent = captured.borrow();
        assert_eq!(sent.len(), 1);
        let reply = decode(&sent[0].1);
        assert!(reply.flag.contains(RdpFlag::SYN | RdpFlag::ACK));
        assert_eq!(reply.seq_number, 5000);
        assert_eq!(reply.ack_number, 100);
    }

    #[test]
    fn test_duplicate_syn_resends_syn_ack() {
        let (mut stack, listen, captured) = setup_listener();
        stack.input_dgram(&PeerId::new(PEER), &syn(100));
        stack.input_dgram(&PeerId::new(PEER), &syn(100));
        assert_eq!(stack.table.len(), 2);
        assert_eq!(stack.table.listen_queue_len(listen), Some(1));
        assert_eq!(captured.borrow().len(), 2);
        // different ISS for the same address is not a new connection either
        stack.input_dgram(&PeerId::new(PEER), &syn(900));
        assert_eq!(stack.table.len(), 2);
        assert_eq!(captured.borrow().len(), 2);
    }

    #[test]
    fn test_handshake_ack_with_data_opens_and_delivers() {
        let (mut stack, listen, captured) = setup_listener();
        stack.input_dgram(&PeerId::new(PEER), &syn(100));
        stack.input_dgram(&PeerId::new(PEER), &segment(RdpFlag::ACK, 101, 5000, b"hi"));
        let id = passive_id(&stack);
        assert_eq!(stack.status(id), RdpStatus::Open);
        assert_eq!(stack.accept(listen).unwrap(), Some(id));
        let mut buf = [0; 8];
        assert_eq!(stack.receive(id, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"hi");
        let ack = decode(&captured.borrow().last().unwrap().1);
        assert_eq!(ack.ack_number, 101);
        assert_eq!(ack.segment_type, RdpSegmentType::Data);
    }

    #[test]
    fn test_wrong_ack_keeps_syn_rcvd() {
        let (mut stack, _listen, _captured) = setup_listener();
        stack.input_dgram(&PeerId::new(PEER), &syn(100));
        stack.input_dgram(&PeerId::new(PEER), &segment(RdpFlag::ACK, 101, 4999, b""));
        assert_eq!(stack.status(passive_id(&stack)), RdpStatus::SynRcvd);
    }

    #[test]
    fn test_rst_removes_connection() {
        let (mut stack, listen, _captured) = setup_listener();
        stack.input_dgram(&PeerId::new(PEER), &syn(100));
        stack.input_dgram(&PeerId::new(PEER), &segment(RdpFlag::ACK, 101, 5000, b""));
        let id = passive_id(&stack);
        stack.input_dgram(&PeerId::new(PEER), &segment(RdpFlag::RST, 101, 0, b""));
        assert_eq!(stack.status(id), RdpStatus::Closed);
        assert!(stack.connection(id).is_none());
        assert_eq!(stack.status(listen), RdpStatus::Listen);
        assert_eq!(stack.accept(listen).unwrap(), None);
    }

    #[test]
    fn test_syn_on_open_is_discarded() {
        let (mut stack, _listen, captured) = setup_listener();
        stack.input_dgram(&PeerId::new(PEER), &syn(100));
        stack.input_dgram(&PeerId::new(PEER), &segment(RdpFlag::ACK, 101, 5000, b""));
        let sent = captured.borrow().len();
        stack.input_dgram(&PeerId::new(PEER), &syn(300));
        let id = passive_id(&stack);
        assert_eq!(stack.status(id), RdpStatus::Open);
        assert_eq!(stack.connection(id).unwrap().recv_vars.current_sequence_num, 100);
        assert_eq!(captured.borrow().len(), sent);
    }

    #[test]
    fn test_listen_queue_is_bounded() {
        let config = RdpConfig {
            max_listen_queue: 1,
            ..Default::default()
        };
        let mut stack = RdpStack::new(config);
        stack.set_callback_output(|_: &PeerId, _: &[u8]| {});
        let listen = stack.listen(80).unwrap();
        stack.input_dgram(&PeerId::new(PEER), &syn(100));
        stack.input_dgram(&PeerId::new([8; 20]), &syn(100));
        assert_eq!(stack.table.listen_queue_len(listen), Some(1));
        assert_eq!(stack.table.len(), 2);
    }

    #[test]
    fn test_unbound_port_is_dropped() {
        let (mut stack, _listen, captured) = setup_listener();
        let mut segment = RdpSegment::new();
        segment.src_port = 2000;
        segment.dst_port = 81;
        segment.segment_type = RdpSegmentType::Syn(SynParams {
            max_outstanding: 4,
            max_segment_size: 512,
            options: SynOption::empty(),
        });
        stack.input_dgram(&PeerId::new(PEER), &segment.create_packet());
        assert_eq!(stack.table.len(), 1);
        assert!(captured.borrow().is_empty());
    }
}
