use crate::rdp::{
    conn::{RdpAddr, RdpConnection},
    defs::{RdpConfig, RdpError, RdpStatus, SendStatus, RDP_WELL_KNOWN_PORT_MAX},
    output::{OutputSink, RdpOutput},
    table::ConnectionTable,
};
use crate::types::PeerId;
use std::cmp::min;
use std::time::Instant;

// One protocol instance. All entry points (application calls, input_dgram,
// timer_handler) take &mut self, so callers on several threads must wrap the
// stack in a single Mutex.
pub struct RdpStack {
    pub config: RdpConfig,
    pub table: ConnectionTable,
    pub(crate) sink: OutputSink,
}

impl RdpStack {
    pub fn new(config: RdpConfig) -> Self {
        Self {
            config,
            table: ConnectionTable::new(),
            sink: OutputSink::new(),
        }
    }

    pub fn set_callback_output<F>(&mut self, func: F)
    where
        F: RdpOutput + 'static,
    {
        self.sink.set_callback(Box::new(func));
    }

    pub fn generate_initial_sequence(&self) -> u32 {
        match self.config.iss {
            Some(iss) => iss,
            None => rand::random::<u32>(),
        }
    }

    pub fn connection(&self, desc: usize) -> Option<&RdpConnection> {
        self.table.lookup_by_descriptor(desc)
    }

    pub fn status(&self, desc: usize) -> RdpStatus {
        match self.table.lookup_by_descriptor(desc) {
            Some(conn) => conn.status,
            None => RdpStatus::Closed,
        }
    }

    pub fn listen(&mut self, port: u16) -> Result<usize, RdpError> {
        let conn = RdpConnection::new_listen(port, &self.config);
        let desc = self.table.bind_listen(port, conn)?;
        log::info!("Listening on port {}. id={}", port, desc);
        Ok(desc)
    }

    fn find_ephemeral_port(&self, did: &PeerId, dport: u16) -> Result<u16, RdpError> {
        (RDP_WELL_KNOWN_PORT_MAX + 1..=u16::MAX)
            .find(|port| !self.table.is_local_port_used(*port))
            .ok_or_else(|| RdpError::NoEphemeralPort {
                peer: did.to_string(),
                dport,
            })
    }

    // sport 0 picks an unused port above the well-known range.
    pub fn connect(&mut self, sport: u16, did: PeerId, dport: u16) -> Result<usize, RdpError> {
        let sport = if sport == 0 {
            self.find_ephemeral_port(&did, dport)?
        } else {
            sport
        };
        let addr = RdpAddr { did, dport, sport };
        let iss = self.generate_initial_sequence();
        let desc = self
            .table
            .bind_active(RdpConnection::new_active(addr, &self.config, iss))?;
        let Some(conn) = self.table.get_mut(desc) else {
            return Err(self.missing_descriptor(desc));
        };
        if let Err(e) = self.sink.send_handler(conn) {
            log::warn!("[{}] Failed to send SYN. Err: {:?}", conn.print_log_prefix(desc), e);
        }
        conn.timer.retransmission.fire(Instant::now(), self.config.rexmt_init);
        log::debug!(
            "[{}] Status changed from CLOSED to SYN-SENT. ISS={}",
            conn.print_log_prefix(desc),
            iss
        );
        Ok(desc)
    }

    // Hands out the oldest OPEN connection created by this listener, if any.
    pub fn accept(&mut self, desc: usize) -> Result<Option<usize>, RdpError> {
        let status = self.checked_status(desc)?;
        if status != RdpStatus::Listen {
            return Err(RdpError::InvalidState {
                desc,
                operation: "accept",
                status,
            });
        }
        let accepted = self.table.pop_established(desc);
        if let Some(id) = accepted {
            log::info!("Accepted connection id={} on listening id={}.", id, desc);
        }
        Ok(accepted)
    }

    pub fn close(&mut self, desc: usize) -> Result<(), RdpError> {
        let status = self.checked_status(desc)?;
        match status {
            RdpStatus::Listen => {
                self.close_listener(desc);
            }
            RdpStatus::Closed | RdpStatus::SynSent => {
                self.table.remove(desc);
                log::debug!("id={} closed from {}.", desc, status);
            }
            RdpStatus::SynRcvd | RdpStatus::Open => {
                let Some(conn) = self.table.get_mut(desc) else {
                    return Err(self.missing_descriptor(desc));
                };
                if let Err(e) = self.sink.send_rst(conn) {
                    log::warn!("[{}] Failed to send RST. Err: {:?}", conn.print_log_prefix(desc), e);
                }
                conn.send_queue.segments.clear();
                conn.timer.retransmission.init();
                conn.timer.close_wait.fire(Instant::now(), self.config.close_wait);
                conn.status = RdpStatus::CloseWait;
                log::debug!(
                    "[{}] Status changed from {} to CLOSE-WAIT.",
                    conn.print_log_prefix(desc),
                    status
                );
            }
            RdpStatus::CloseWait => {}
        }
        Ok(())
    }

    // Connections not yet accepted are reset. Accepted ones stay up.
    fn close_listener(&mut self, desc: usize) {
        for child in self.table.listen_children(desc) {
            if let Some(conn) = self.table.lookup_by_descriptor(child) {
                if let Err(e) = self.sink.send_rst(conn) {
                    log::warn!("[{}] Failed to send RST. Err: {:?}", conn.print_log_prefix(child), e);
                }
            }
            self.table.remove(child);
        }
        self.table.remove(desc);
        log::info!("Listening socket id={} closed.", desc);
    }

    pub fn send(&mut self, desc: usize, buf: &[u8]) -> Result<SendStatus, RdpError> {
        self.enqueue(desc, buf, false, "send")
    }

    // Sends a NUL segment. It occupies a sequence number and is retransmitted like data.
    pub fn keepalive(&mut self, desc: usize) -> Result<SendStatus, RdpError> {
        self.enqueue(desc, &[], true, "keepalive")
    }

    fn enqueue(&mut self, desc: usize, buf: &[u8], nul: bool, operation: &'static str) -> Result<SendStatus, RdpError> {
        let Some(conn) = self.table.get_mut(desc) else {
            return Err(self.missing_descriptor(desc));
        };
        if conn.status != RdpStatus::Open {
            return Err(RdpError::InvalidState {
                desc,
                operation,
                status: conn.status,
            });
        }
        let len = min(buf.len(), conn.send_vars.sbuf_max as usize);
        // A data segment without payload would not occupy a sequence number.
        if len == 0 && !nul {
            return Ok(SendStatus::Accepted(0));
        }
        if !conn.can_send() {
            log::trace!(
                "[{}] Send window is full. outstanding={} SND.MAX={}",
                conn.print_log_prefix(desc),
                conn.outstanding(),
                conn.send_vars.max_outstanding
            );
            return Ok(SendStatus::Backpressure);
        }
        let seq = conn.enqueue_segment(buf[..len].to_vec(), nul);
        if let Err(e) = self.sink.send_datagram(conn, seq) {
            log::warn!("[{}] Failed to send SEQ={}. Err: {:?}", conn.print_log_prefix(desc), seq, e);
        }
        if !conn.timer.retransmission.active {
            conn.timer.retransmission.fire(Instant::now(), self.config.rexmt_init);
        }
        log::trace!(
            "[{}] Queued SEQ={} ({} bytes). outstanding={}",
            conn.print_log_prefix(desc),
            seq,
            len,
            conn.outstanding()
        );
        Ok(SendStatus::Accepted(len))
    }

    // Non-blocking. Returns 0 when no in-order data is ready.
    pub fn receive(&mut self, desc: usize, buf: &mut [u8]) -> Result<usize, RdpError> {
        let Some(conn) = self.table.get_mut(desc) else {
            return Err(self.missing_descriptor(desc));
        };
        match conn.status {
            RdpStatus::Open | RdpStatus::CloseWait => Ok(conn.recv_queue.read(buf)),
            status => Err(RdpError::InvalidState {
                desc,
                operation: "receive",
                status,
            }),
        }
    }

    fn checked_status(&self, desc: usize) -> Result<RdpStatus, RdpError> {
        self.table
            .lookup_by_descriptor(desc)
            .map(|conn| conn.status)
            .ok_or_else(|| self.missing_descriptor(desc))
    }

    // A descriptor removed by close, RST or timeout reports the closed
    // connection rather than an unknown descriptor.
    fn missing_descriptor(&self, desc: usize) -> RdpError {
        if self.table.is_retired(desc) {
            RdpError::ConnectionClosed { desc }
        } else {
            RdpError::UnknownDescriptor { desc }
        }
    }
}

#[cfg(test)]
mod usrreq_tests {
    use super::*;
    use crate::rdp::packet::{RdpFlag, RdpSegment, RdpSegmentType};
    use rstest::rstest;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Captured = Rc<RefCell<Vec<(PeerId, Vec<u8>)>>>;

    fn setup_stack(config: RdpConfig) -> (RdpStack, Captured) {
        let mut stack = RdpStack::new(config);
        let captured: Captured = Rc::new(RefCell::new(Vec::new()));
        let sink = captured.clone();
        stack.set_callback_output(move |dst: &PeerId, buf: &[u8]| {
            sink.borrow_mut().push((*dst, buf.to_vec()));
        });
        (stack, captured)
    }

    #[test]
    fn test_connect_sends_syn() {
        let (mut stack, captured) = setup_stack(RdpConfig {
            iss: Some(42),
            ..Default::default()
        });
        let peer = PeerId::new([9; 20]);
        let desc = stack.connect(0, peer, 80).unwrap();
        assert_eq!(stack.status(desc), RdpStatus::SynSent);
        let conn = stack.connection(desc).unwrap();
        assert_eq!(conn.local_port, RDP_WELL_KNOWN_PORT_MAX + 1);
        assert!(conn.timer.retransmission.active);
        let sent = captured.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, peer);
        let mut syn = RdpSegment::new();
        syn.read(&sent[0].1).unwrap();
        assert!(syn.flag.contains(RdpFlag::SYN));
        assert!(matches!(syn.segment_type, RdpSegmentType::Syn(_)));
        assert_eq!(syn.seq_number, 42);
        assert_eq!(syn.dst_port, 80);
    }

    #[test]
    fn test_ephemeral_ports_are_distinct() {
        let (mut stack, _captured) = setup_stack(RdpConfig::default());
        let peer = PeerId::new([9; 20]);
        let first = stack.connect(0, peer, 80).unwrap();
        let second = stack.connect(0, peer, 80).unwrap();
        assert_ne!(
            stack.connection(first).unwrap().local_port,
            stack.connection(second).unwrap().local_port
        );
    }

    #[test]
    fn test_duplicate_address_is_rejected() {
        let (mut stack, _captured) = setup_stack(RdpConfig::default());
        let peer = PeerId::new([9; 20]);
        stack.connect(3000, peer, 80).unwrap();
        assert_eq!(
            stack.connect(3000, peer, 80),
            Err(RdpError::AddressInUse {
                peer: peer.to_string(),
                dport: 80,
                sport: 3000
            })
        );
    }

    #[test]
    fn test_listen_twice_fails() {
        let (mut stack, _captured) = setup_stack(RdpConfig::default());
        stack.listen(80).unwrap();
        assert_eq!(stack.listen(80), Err(RdpError::PortInUse { port: 80 }));
    }

    #[rstest]
    #[case("send")]
    #[case("receive")]
    #[case("accept")]
    fn test_operation_in_wrong_state(#[case] operation: &str) {
        let (mut stack, _captured) = setup_stack(RdpConfig::default());
        let desc = stack.connect(3000, PeerId::new([9; 20]), 80).unwrap();
        let result = match operation {
            "send" => stack.send(desc, b"data").map(|_| ()),
            "receive" => stack.receive(desc, &mut [0; 4]).map(|_| ()),
            _ => stack.accept(desc).map(|_| ()),
        };
        assert!(matches!(
            result,
            Err(RdpError::InvalidState {
                status: RdpStatus::SynSent,
                ..
            })
        ));
    }

    #[test]
    fn test_unknown_descriptor() {
        let (mut stack, _captured) = setup_stack(RdpConfig::default());
        assert_eq!(stack.status(77), RdpStatus::Closed);
        assert_eq!(stack.close(77), Err(RdpError::UnknownDescriptor { desc: 77 }));
        assert_eq!(stack.send(77, b"x"), Err(RdpError::UnknownDescriptor { desc: 77 }));
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    fn test_close_before_open_removes(#[case] listening: bool) {
        let (mut stack, captured) = setup_stack(RdpConfig::default());
        let desc = if listening {
            stack.listen(80).unwrap()
        } else {
            stack.connect(3000, PeerId::new([9; 20]), 80).unwrap()
        };
        let sent = captured.borrow().len();
        stack.close(desc).unwrap();
        assert_eq!(stack.status(desc), RdpStatus::Closed);
        assert!(stack.table.is_empty());
        assert_eq!(captured.borrow().len(), sent);
        assert_eq!(stack.close(desc), Err(RdpError::ConnectionClosed { desc }));
        assert_eq!(stack.send(desc, b"x"), Err(RdpError::ConnectionClosed { desc }));
    }
}
