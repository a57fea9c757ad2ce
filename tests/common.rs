#![allow(dead_code)]
use anyhow::{Context, Result};
use rdp_r::{
    rdp::{
        defs::{RdpConfig, RdpStatus},
        packet::RdpSegment,
        usrreq::RdpStack,
    },
    types::PeerId,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

pub const SERVER_PORT: u16 = 80;
pub const SERVER_ISS: u32 = 7000;
pub const CLIENT_ISS: u32 = 1000;

#[derive(Debug, Clone)]
pub struct Datagram {
    pub src: PeerId,
    pub dst: PeerId,
    pub bytes: Vec<u8>,
}

impl Datagram {
    pub fn segment(&self) -> Result<RdpSegment> {
        decode(&self.bytes)
    }
}

pub type Wire = Rc<RefCell<VecDeque<Datagram>>>;

pub fn decode(bytes: &[u8]) -> Result<RdpSegment> {
    let mut segment = RdpSegment::new();
    segment.read(bytes).context("Failed to decode captured datagram.")?;
    Ok(segment)
}

// Two stacks joined by one queue. Nothing moves until the test delivers it.
pub struct Link {
    pub server: RdpStack,
    pub client: RdpStack,
    pub server_id: PeerId,
    pub client_id: PeerId,
    pub wire: Wire,
}

impl Link {
    pub fn new(server_config: RdpConfig, client_config: RdpConfig) -> Self {
        let wire: Wire = Rc::new(RefCell::new(VecDeque::new()));
        let server_id = PeerId::new([0xaa; 20]);
        let client_id = PeerId::new([0xbb; 20]);
        let mut server = RdpStack::new(server_config);
        let mut client = RdpStack::new(client_config);
        attach(&mut server, server_id, &wire);
        attach(&mut client, client_id, &wire);
        Self {
            server,
            client,
            server_id,
            client_id,
            wire,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(config(SERVER_ISS), config(CLIENT_ISS))
    }

    pub fn in_flight(&self) -> usize {
        self.wire.borrow().len()
    }

    pub fn take_in_flight(&self) -> Vec<Datagram> {
        self.wire.borrow_mut().drain(..).collect()
    }

    pub fn drop_all(&self) -> usize {
        self.take_in_flight().len()
    }

    pub fn deliver(&mut self, datagram: &Datagram) {
        if datagram.dst == self.server_id {
            self.server.input_dgram(&datagram.src, &datagram.bytes);
        } else if datagram.dst == self.client_id {
            self.client.input_dgram(&datagram.src, &datagram.bytes);
        }
    }

    // Delivers until the link is quiet. Returns the number of datagrams moved.
    pub fn deliver_all(&mut self) -> Result<usize> {
        let mut moved = 0;
        for _ in 0..1000 {
            let batch = self.take_in_flight();
            if batch.is_empty() {
                return Ok(moved);
            }
            for datagram in batch.iter() {
                self.deliver(datagram);
                moved += 1;
            }
        }
        anyhow::bail!("Link did not settle after {} datagrams.", moved)
    }

    // listen + connect + accept. Returns (listen, client, server) descriptors.
    pub fn open(&mut self) -> Result<(usize, usize, usize)> {
        let listen = self.server.listen(SERVER_PORT)?;
        let client = self.client.connect(0, self.server_id, SERVER_PORT)?;
        self.deliver_all()?;
        anyhow::ensure!(
            self.client.status(client) == RdpStatus::Open,
            "Client is {} after handshake.",
            self.client.status(client)
        );
        let server = self
            .server
            .accept(listen)?
            .context("No connection to accept after handshake.")?;
        Ok((listen, client, server))
    }
}

pub fn config(iss: u32) -> RdpConfig {
    RdpConfig {
        iss: Some(iss),
        ..Default::default()
    }
}

fn attach(stack: &mut RdpStack, id: PeerId, wire: &Wire) {
    let wire = wire.clone();
    stack.set_callback_output(move |dst: &PeerId, buf: &[u8]| {
        wire.borrow_mut().push_back(Datagram {
            src: id,
            dst: *dst,
            bytes: buf.to_vec(),
        });
    });
}

pub fn receive_all(stack: &mut RdpStack, desc: usize) -> Result<Vec<u8>> {
    let mut received = Vec::new();
    let mut buf = [0; 256];
    loop {
        let amt = stack.receive(desc, &mut buf)?;
        if amt == 0 {
            return Ok(received);
        }
        received.extend_from_slice(&buf[..amt]);
    }
}
