use crate::rdp::{
    conn::RdpConnection,
    defs::RdpStatus,
    packet::RdpSegment,
};
use crate::types::PeerId;
use anyhow::{Context, Result};

// Hook into the layer below (the overlay's UDP socket). Must not block.
pub trait RdpOutput {
    fn output(&mut self, dst: &PeerId, buf: &[u8]);
}

impl<F> RdpOutput for F
where
    F: FnMut(&PeerId, &[u8]),
{
    fn output(&mut self, dst: &PeerId, buf: &[u8]) {
        (self)(dst, buf)
    }
}

#[derive(Default)]
pub struct OutputSink {
    func: Option<Box<dyn RdpOutput>>,
}

impl OutputSink {
    pub fn new() -> Self {
        Self { func: None }
    }

    pub fn set_callback(&mut self, func: Box<dyn RdpOutput>) {
        self.func = Some(func);
    }

    pub fn send_segment(&mut self, dst: &PeerId, mut segment: RdpSegment) -> Result<()> {
        let Some(func) = self.func.as_mut() else {
            anyhow::bail!("No output callback is set. Dropping {}", segment.print_general_info());
        };
        let packet = segment.create_packet();
        func.output(dst, &packet);
        log::trace!("Send a rdp segment to {}. {}", dst, segment.print_general_info());
        Ok(())
    }

    // Entry point for (re)sending whatever the connection still owes its peer.
    pub fn send_handler(&mut self, conn: &mut RdpConnection) -> Result<usize> {
        match &conn.status {
            RdpStatus::SynSent => Ok(self.send_handler_syn_sent(conn).context("send_handler_syn_sent failed.")?),
            RdpStatus::SynRcvd => Ok(self.send_handler_syn_rcvd(conn).context("send_handler_syn_rcvd failed.")?),
            RdpStatus::Open => Ok(self.send_handler_open(conn).context("send_handler_open failed.")?),
            other => {
                anyhow::bail!("Send handler for {} is not implemented.", other);
            }
        }
    }

    fn send_handler_syn_sent(&mut self, conn: &mut RdpConnection) -> Result<usize> {
        let syn = RdpSegment::new_syn(conn)?;
        self.send_segment(&conn.remote()?.did, syn)?;
        Ok(1)
    }

    fn send_handler_syn_rcvd(&mut self, conn: &mut RdpConnection) -> Result<usize> {
        let syn_ack = RdpSegment::new_syn_ack(conn)?;
        self.send_segment(&conn.remote()?.did, syn_ack)?;
        Ok(1)
    }

    // Only the oldest segment neither acknowledged nor named in an EACK.
    fn send_handler_open(&mut self, conn: &mut RdpConnection) -> Result<usize> {
        let Some(oldest) = conn.send_queue.segments.front() else {
            return Ok(0);
        };
        let datagram = RdpSegment::new_datagram(conn, oldest)?;
        self.send_segment(&conn.remote()?.did, datagram)?;
        Ok(1)
    }

    pub fn send_datagram(&mut self, conn: &RdpConnection, seq: u32) -> Result<()> {
        let queued = conn
            .send_queue
            .segments
            .iter()
            .find(|queued| queued.seq == seq)
            .context(format!("SEQ={} is not in the send queue.", seq))?;
        let datagram = RdpSegment::new_datagram(conn, queued)?;
        self.send_segment(&conn.remote()?.did, datagram)
    }

    // ACK, or EACK while segments are held out of sequence.
    pub fn send_ack(&mut self, conn: &RdpConnection) -> Result<()> {
        let ack = if conn.recv_queue.rcvdsendq.is_empty() {
            RdpSegment::new_ack(conn)?
        } else {
            RdpSegment::new_eack(conn)?
        };
        self.send_segment(&conn.remote()?.did, ack)
    }

    pub fn send_rst(&mut self, conn: &RdpConnection) -> Result<()> {
        let rst = RdpSegment::new_rst(conn)?;
        self.send_segment(&conn.remote()?.did, rst)
    }
}
