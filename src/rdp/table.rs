use crate::rdp::{
    conn::{RdpAddr, RdpConnection},
    defs::{RdpError, RdpStatus, RDP_MAX_CONNECTIONS},
};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Default)]
pub struct ListenQueue {
    pub pending: VecDeque<usize>,     // Received SYN and replied SYN/ACK
    pub established: VecDeque<usize>, // OPEN but not yet handed out by accept
}

impl ListenQueue {
    pub fn len(&self) -> usize {
        self.pending.len() + self.established.len()
    }
}

// Owns every connection. Other components only hold descriptors or addresses.
// The port and address maps are kept consistent with `conns` by going through
// bind_*/remove only.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    conns: HashMap<usize, RdpConnection>,
    addr2desc: HashMap<RdpAddr, usize>,
    port2listen: HashMap<u16, usize>,
    listen2port: HashMap<usize, u16>,
    listen_queue: HashMap<usize, ListenQueue>,
    next_desc: usize,
    wrapped: bool,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            next_desc: 1,
            ..Default::default()
        }
    }

    // Descriptors are handed out round robin, so a descriptor still draining
    // in CLOSE-WAIT is never given to a new connection.
    fn allocate_descriptor(&mut self) -> Result<usize, RdpError> {
        if self.conns.len() >= RDP_MAX_CONNECTIONS {
            return Err(RdpError::NoDescriptor { max: RDP_MAX_CONNECTIONS });
        }
        loop {
            let desc = self.next_desc;
            if self.next_desc >= usize::MAX / 2 {
                self.next_desc = 1;
                self.wrapped = true;
            } else {
                self.next_desc += 1;
            }
            if !self.conns.contains_key(&desc) {
                return Ok(desc);
            }
        }
    }

    pub fn bind_listen(&mut self, port: u16, conn: RdpConnection) -> Result<usize, RdpError> {
        if self.port2listen.contains_key(&port) {
            return Err(RdpError::PortInUse { port });
        }
        let desc = self.allocate_descriptor()?;
        self.port2listen.insert(port, desc);
        self.listen2port.insert(desc, port);
        self.listen_queue.insert(desc, ListenQueue::default());
        self.conns.insert(desc, conn);
        Ok(desc)
    }

    pub fn bind_active(&mut self, conn: RdpConnection) -> Result<usize, RdpError> {
        let Some(addr) = conn.addr else {
            return Err(RdpError::InvalidState {
                desc: 0,
                operation: "bind_active",
                status: conn.status,
            });
        };
        if self.addr2desc.contains_key(&addr) {
            return Err(RdpError::AddressInUse {
                peer: addr.did.to_string(),
                dport: addr.dport,
                sport: addr.sport,
            });
        }
        let desc = self.allocate_descriptor()?;
        self.addr2desc.insert(addr, desc);
        self.conns.insert(desc, conn);
        Ok(desc)
    }

    pub fn bind_passive(&mut self, parent: usize, conn: RdpConnection) -> Result<usize, RdpError> {
        let desc = self.bind_active(conn)?;
        if let Some(queue) = self.listen_queue.get_mut(&parent) {
            queue.pending.push_back(desc);
        }
        Ok(desc)
    }

    pub fn lookup_by_addr(&self, addr: &RdpAddr) -> Option<usize> {
        self.addr2desc.get(addr).copied()
    }

    pub fn lookup_listen(&self, port: u16) -> Option<usize> {
        self.port2listen.get(&port).copied()
    }

    pub fn lookup_by_descriptor(&self, desc: usize) -> Option<&RdpConnection> {
        self.conns.get(&desc)
    }

    // Handed out once and removed since. Until the counter wraps every
    // descriptor below `next_desc` has been allocated.
    pub fn is_retired(&self, desc: usize) -> bool {
        desc != 0 && !self.conns.contains_key(&desc) && (self.wrapped || desc < self.next_desc)
    }

    pub fn get_mut(&mut self, desc: usize) -> Option<&mut RdpConnection> {
        self.conns.get_mut(&desc)
    }

    pub fn descriptors(&self) -> Vec<usize> {
        let mut descs: Vec<usize> = self.conns.keys().copied().collect();
        descs.sort_unstable();
        descs
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn is_local_port_used(&self, port: u16) -> bool {
        self.port2listen.contains_key(&port) || self.conns.values().any(|conn| conn.local_port == port)
    }

    pub fn listen_queue_len(&self, listen: usize) -> Option<usize> {
        self.listen_queue.get(&listen).map(|queue| queue.len())
    }

    pub fn listen_children(&self, listen: usize) -> Vec<usize> {
        match self.listen_queue.get(&listen) {
            Some(queue) => queue.pending.iter().chain(queue.established.iter()).copied().collect(),
            None => Vec::new(),
        }
    }

    pub fn mark_established(&mut self, desc: usize) {
        let Some(parent) = self.conns.get(&desc).and_then(|conn| conn.parent_id) else {
            return;
        };
        if let Some(queue) = self.listen_queue.get_mut(&parent) {
            queue.pending.retain(|&id| id != desc);
            if !queue.established.contains(&desc) {
                queue.established.push_back(desc);
            }
        }
    }

    pub fn pop_established(&mut self, listen: usize) -> Option<usize> {
        let queue = self.listen_queue.get_mut(&listen)?;
        while let Some(desc) = queue.established.pop_front() {
            match self.conns.get_mut(&desc) {
                Some(conn) if conn.status == RdpStatus::Open || conn.status == RdpStatus::CloseWait => {
                    conn.parent_id = None;
                    return Some(desc);
                }
                _ => continue,
            }
        }
        None
    }

    pub fn remove(&mut self, desc: usize) -> Option<RdpConnection> {
        let conn = self.conns.remove(&desc)?;
        if let Some(addr) = &conn.addr {
            if self.addr2desc.get(addr) == Some(&desc) {
                self.addr2desc.remove(addr);
            }
        }
        if let Some(port) = self.listen2port.remove(&desc) {
            self.port2listen.remove(&port);
        }
        // Connections still queued on a removed listener can no longer be accepted.
        if let Some(queue) = self.listen_queue.remove(&desc) {
            for child in queue.pending.iter().chain(queue.established.iter()) {
                if let Some(child_conn) = self.conns.get_mut(child) {
                    child_conn.parent_id = None;
                }
            }
        }
        if let Some(parent) = conn.parent_id {
            if let Some(queue) = self.listen_queue.get_mut(&parent) {
                queue.pending.retain(|&id| id != desc);
                queue.established.retain(|&id| id != desc);
            }
        }
        Some(conn)
    }
}

#[cfg(test)]
mod table_tests {
    use super::*;
    use crate::rdp::defs::RdpConfig;
    use crate::types::PeerId;
    use rstest::rstest;

    fn addr(byte: u8, dport: u16, sport: u16) -> RdpAddr {
        RdpAddr {
            did: PeerId::new([byte; 20]),
            dport,
            sport,
        }
    }

    #[test]
    fn test_listen_port_is_unique() {
        let config = RdpConfig::default();
        let mut table = ConnectionTable::new();
        let desc = table.bind_listen(100, RdpConnection::new_listen(100, &config)).unwrap();
        assert_eq!(table.lookup_listen(100), Some(desc));
        assert_eq!(
            table.bind_listen(100, RdpConnection::new_listen(100, &config)),
            Err(RdpError::PortInUse { port: 100 })
        );
        table.remove(desc);
        assert_eq!(table.lookup_listen(100), None);
        assert!(table.bind_listen(100, RdpConnection::new_listen(100, &config)).is_ok());
    }

    #[rstest]
    #[case(addr(1, 100, 2000), addr(1, 100, 2000), false)]
    #[case(addr(1, 100, 2000), addr(2, 100, 2000), true)]
    #[case(addr(1, 100, 2000), addr(1, 101, 2000), true)]
    #[case(addr(1, 100, 2000), addr(1, 100, 2001), true)]
    fn test_address_is_unique(#[case] first: RdpAddr, #[case] second: RdpAddr, #[case] expected_ok: bool) {
        let config = RdpConfig::default();
        let mut table = ConnectionTable::new();
        let desc = table.bind_active(RdpConnection::new_active(first, &config, 1)).unwrap();
        assert_eq!(table.lookup_by_addr(&first), Some(desc));
        let result = table.bind_active(RdpConnection::new_active(second, &config, 1));
        assert_eq!(result.is_ok(), expected_ok);
        assert_eq!(table.len(), if expected_ok { 2 } else { 1 });
    }

    #[test]
    fn test_descriptor_not_reused_while_draining() {
        let config = RdpConfig::default();
        let mut table = ConnectionTable::new();
        let first = table.bind_active(RdpConnection::new_active(addr(1, 1, 1), &config, 1)).unwrap();
        table.get_mut(first).unwrap().status = RdpStatus::CloseWait;
        let second = table.bind_active(RdpConnection::new_active(addr(1, 1, 2), &config, 1)).unwrap();
        assert_ne!(first, second);
        table.remove(first);
        let third = table.bind_active(RdpConnection::new_active(addr(1, 1, 3), &config, 1)).unwrap();
        assert_ne!(third, first);
        assert_ne!(third, second);
        assert!(table.lookup_by_descriptor(first).is_none());
        assert_eq!(table.lookup_by_addr(&addr(1, 1, 1)), None);
    }

    #[test]
    fn test_removed_descriptor_is_retired() {
        let config = RdpConfig::default();
        let mut table = ConnectionTable::new();
        let desc = table.bind_active(RdpConnection::new_active(addr(1, 1, 1), &config, 1)).unwrap();
        assert!(!table.is_retired(desc));
        table.remove(desc);
        assert!(table.is_retired(desc));
        assert!(!table.is_retired(0));
        assert!(!table.is_retired(desc + 1));
    }

    #[test]
    fn test_listen_queue_flow() {
        let config = RdpConfig::default();
        let mut table = ConnectionTable::new();
        let listen = table.bind_listen(100, RdpConnection::new_listen(100, &config)).unwrap();
        let child = table
            .bind_passive(listen, RdpConnection::new_passive(addr(3, 5000, 100), listen, &config, 9))
            .unwrap();
        assert_eq!(table.listen_queue_len(listen), Some(1));
        assert_eq!(table.pop_established(listen), None);
        table.get_mut(child).unwrap().status = RdpStatus::Open;
        table.mark_established(child);
        assert_eq!(table.pop_established(listen), Some(child));
        assert_eq!(table.listen_queue_len(listen), Some(0));
        assert_eq!(table.lookup_by_descriptor(child).unwrap().parent_id, None);
    }
}
