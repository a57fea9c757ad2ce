use crate::rdp::{conn::{RdpConnection, SendSegment}, defs::RDP_VERSION};
use anyhow::Result;
use bitflags::bitflags;

pub const RDP_HEADER_LENGTH: usize = 17;
const RDP_SYN_EXTENSION_LENGTH: usize = 6;
pub const RDP_SYN_HEADER_LENGTH: usize = RDP_HEADER_LENGTH + RDP_SYN_EXTENSION_LENGTH;
// EACK entries must fit in the one byte header length field.
pub const RDP_EACK_MAX: usize = (u8::MAX as usize - RDP_HEADER_LENGTH) / 4;

//  0             7 8            15 16                           31
// +-+-+-+-+-+-+-+-+---------------+-------------------------------+
// |S|A|E|R|N| |Ver|    Header     |          Source Port          |
// |Y|C|A|S|U|0|No.|    Length     |                               |
// |N|K|K|T|L| |   |               |                               |
// +-+-+-+-+-+-+---+---------------+-------------------------------+
// |       Destination Port        |          Data Length          |
// +-------------------------------+-------------------------------+
// |                        Sequence Number                        |
// +---------------------------------------------------------------+
// |                     Acknowledgement Number                    |
// +---------------+-----------------------------------------------+
// |   Checksum    |   Variable Header Area (SYN / EACK) ...       :
// +---------------+-----------------------------------------------+
// :                             Data                              :
// +---------------------------------------------------------------+
//
// SYN variable area: max outstanding segments (2), max segment size (2), options (2).
// EACK variable area: 4 bytes per out-of-sequence segment received.
//
// The checksum is the complement of the byte-wise sum over header and data
// with the checksum byte set to zero.
#[derive(Debug, Clone, PartialEq)]
pub struct RdpSegment {
    pub flag: RdpFlag,
    pub header_length: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub data_length: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub checksum: u8,
    pub segment_type: RdpSegmentType,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RdpSegmentType {
    Syn(SynParams),
    Eack(Vec<u32>),
    Rst,
    Nul,
    Data, // ACK and/or payload
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynParams {
    pub max_outstanding: u16,
    pub max_segment_size: u16,
    pub options: SynOption,
}

bitflags! {
    #[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
    pub struct RdpFlag: u8 {
        const SYN = 0b1000_0000; // Open a connection.
        const ACK = 0b0100_0000; // Acknowledgement number is valid.
        const EAK = 0b0010_0000; // Extended acknowledgement follows the header.
        const RST = 0b0001_0000; // Reset the connection.
        const NUL = 0b0000_1000; // Keep-alive, carries no data.
        const VER = 0b0000_0011; // Version field.
    }
}

bitflags! {
    #[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
    pub struct SynOption: u16 {
        const SEQUENCED = 0b1000_0000_0000_0000; // Sequenced delivery mode.
    }
}

impl RdpFlag {
    pub fn version(&self) -> u8 {
        self.bits() & RdpFlag::VER.bits()
    }

    pub fn with_version(self) -> Self {
        self.difference(RdpFlag::VER) | RdpFlag::from_bits_retain(RDP_VERSION)
    }
}

impl RdpSegment {
    pub fn new() -> Self {
        Self {
            flag: RdpFlag::empty().with_version(),
            header_length: RDP_HEADER_LENGTH as u8,
            src_port: 0,
            dst_port: 0,
            data_length: 0,
            seq_number: 0,
            ack_number: 0,
            checksum: 0,
            segment_type: RdpSegmentType::Data,
            payload: Vec::new(),
        }
    }

    pub fn read(&mut self, buf: &[u8]) -> Result<()> {
        let len = buf.len();
        anyhow::ensure!(
            len >= RDP_HEADER_LENGTH,
            "RDP segment length is {}, must be larger than header length ({}).",
            len,
            RDP_HEADER_LENGTH
        );
        self.flag = RdpFlag::from_bits_retain(buf[0]);
        anyhow::ensure!(
            self.flag.version() == RDP_VERSION,
            "RDP version is {}, expected {}.",
            self.flag.version(),
            RDP_VERSION
        );
        self.header_length = buf[1];
        self.src_port = u16::from_be_bytes(buf[2..4].try_into()?);
        self.dst_port = u16::from_be_bytes(buf[4..6].try_into()?);
        self.data_length = u16::from_be_bytes(buf[6..8].try_into()?);
        self.seq_number = u32::from_be_bytes(buf[8..12].try_into()?);
        self.ack_number = u32::from_be_bytes(buf[12..16].try_into()?);
        self.checksum = buf[16];
        let hlen = self.header_length as usize;
        anyhow::ensure!(
            hlen >= RDP_HEADER_LENGTH && hlen + self.data_length as usize == len,
            "RDP segment length is {}, but header indicates header length {} and data length {}.",
            len,
            hlen,
            self.data_length
        );
        let expected_checksum = calc_checksum(buf);
        anyhow::ensure!(
            self.checksum == expected_checksum,
            "RDP header has bad checksum 0x{:x}, expected 0x{:x}.",
            self.checksum,
            expected_checksum
        );
        self.segment_type = self.read_segment_type(&buf[RDP_HEADER_LENGTH..hlen])?;
        self.payload = buf[hlen..].to_vec();
        Ok(())
    }

    fn read_segment_type(&self, variable: &[u8]) -> Result<RdpSegmentType> {
        let flag = self.flag;
        let has_data = self.data_length > 0;
        if flag.contains(RdpFlag::SYN) {
            anyhow::ensure!(
                !flag.intersects(RdpFlag::EAK | RdpFlag::RST | RdpFlag::NUL),
                "SYN segment must not carry EAK/RST/NUL. FLAG={:?}",
                flag
            );
            anyhow::ensure!(
                variable.len() == RDP_SYN_EXTENSION_LENGTH && !has_data,
                "SYN segment header length is {} and data length {}, expected {} and 0.",
                self.header_length,
                self.data_length,
                RDP_SYN_HEADER_LENGTH
            );
            Ok(RdpSegmentType::Syn(SynParams {
                max_outstanding: u16::from_be_bytes(variable[0..2].try_into()?),
                max_segment_size: u16::from_be_bytes(variable[2..4].try_into()?),
                options: SynOption::from_bits_retain(u16::from_be_bytes(variable[4..6].try_into()?)),
            }))
        } else if flag.contains(RdpFlag::RST) {
            anyhow::ensure!(
                !flag.intersects(RdpFlag::EAK | RdpFlag::NUL) && variable.is_empty() && !has_data,
                "RST segment must be a bare header. FLAG={:?} HLEN={} DLEN={}",
                flag,
                self.header_length,
                self.data_length
            );
            Ok(RdpSegmentType::Rst)
        } else if flag.contains(RdpFlag::NUL) {
            anyhow::ensure!(
                !flag.contains(RdpFlag::EAK) && variable.is_empty() && !has_data,
                "NUL segment must be a bare header. FLAG={:?} HLEN={} DLEN={}",
                flag,
                self.header_length,
                self.data_length
            );
            Ok(RdpSegmentType::Nul)
        } else if flag.contains(RdpFlag::EAK) {
            anyhow::ensure!(
                flag.contains(RdpFlag::ACK) && !variable.is_empty() && variable.len() % 4 == 0,
                "EACK segment needs ACK and a 4 byte aligned list. FLAG={:?} HLEN={}",
                flag,
                self.header_length
            );
            let mut eacks = Vec::new();
            for chunk in variable.chunks_exact(4) {
                eacks.push(u32::from_be_bytes(chunk.try_into()?));
            }
            Ok(RdpSegmentType::Eack(eacks))
        } else {
            anyhow::ensure!(
                variable.is_empty(),
                "Segment without SYN/EAK must not have a variable header. HLEN={}",
                self.header_length
            );
            anyhow::ensure!(
                flag.contains(RdpFlag::ACK) || has_data,
                "Segment carries neither ACK nor data. FLAG={:?}",
                flag
            );
            Ok(RdpSegmentType::Data)
        }
    }

    fn create_variable_header(&self) -> Vec<u8> {
        let mut variable = Vec::new();
        match &self.segment_type {
            RdpSegmentType::Syn(params) => {
                variable.extend_from_slice(&params.max_outstanding.to_be_bytes());
                variable.extend_from_slice(&params.max_segment_size.to_be_bytes());
                variable.extend_from_slice(&params.options.bits().to_be_bytes());
            }
            RdpSegmentType::Eack(eacks) => {
                for seq in eacks.iter().take(RDP_EACK_MAX) {
                    variable.extend_from_slice(&seq.to_be_bytes());
                }
            }
            RdpSegmentType::Rst | RdpSegmentType::Nul | RdpSegmentType::Data => {}
        }
        variable
    }

    pub fn create_header(&self) -> Vec<u8> {
        let mut header = Vec::new();
        header.push(self.flag.bits());
        header.push(self.header_length);
        header.extend_from_slice(&self.src_port.to_be_bytes());
        header.extend_from_slice(&self.dst_port.to_be_bytes());
        header.extend_from_slice(&self.data_length.to_be_bytes());
        header.extend_from_slice(&self.seq_number.to_be_bytes());
        header.extend_from_slice(&self.ack_number.to_be_bytes());
        header.push(self.checksum);
        header.extend(self.create_variable_header());
        header
    }

    fn set_packet_params(&mut self) {
        // set flag, header_length and data_length. checksum is set after serialization.
        self.flag = match self.segment_type {
            RdpSegmentType::Syn(_) => self.flag | RdpFlag::SYN,
            RdpSegmentType::Eack(_) => self.flag | RdpFlag::EAK | RdpFlag::ACK,
            RdpSegmentType::Rst => self.flag | RdpFlag::RST,
            RdpSegmentType::Nul => self.flag | RdpFlag::NUL,
            RdpSegmentType::Data => self.flag,
        }
        .with_version();
        self.header_length = (RDP_HEADER_LENGTH + self.create_variable_header().len()) as u8;
        self.data_length = self.payload.len() as u16;
        self.checksum = 0;
    }

    pub fn create_packet(&mut self) -> Vec<u8> {
        self.set_packet_params();
        let mut packet = self.create_header();
        packet.extend_from_slice(&self.payload);
        self.checksum = calc_checksum(&packet);
        packet[16] = self.checksum;
        packet
    }

    // Data, NUL and SYN segments occupy a sequence number. Bare ACK/EACK segments do not.
    pub fn consumes_sequence(&self) -> bool {
        match self.segment_type {
            RdpSegmentType::Syn(_) | RdpSegmentType::Nul => true,
            RdpSegmentType::Eack(_) | RdpSegmentType::Data => !self.payload.is_empty(),
            RdpSegmentType::Rst => false,
        }
    }

    fn new_base(conn: &RdpConnection) -> Result<Self> {
        let addr = conn.remote()?;
        let mut segment = Self::new();
        segment.src_port = conn.local_port;
        segment.dst_port = addr.dport;
        Ok(segment)
    }

    fn syn_params(conn: &RdpConnection) -> SynParams {
        let mut options = SynOption::empty();
        if conn.sequenced {
            options |= SynOption::SEQUENCED;
        }
        SynParams {
            max_outstanding: conn.recv_vars.max_segments.min(u16::MAX as u32) as u16,
            max_segment_size: conn.recv_vars.rbuf_max.min(u16::MAX as u32) as u16,
            options,
        }
    }

    pub fn new_syn(conn: &RdpConnection) -> Result<Self> {
        let mut syn = Self::new_base(conn)?;
        syn.seq_number = conn.send_vars.initial_sequence_num;
        syn.segment_type = RdpSegmentType::Syn(Self::syn_params(conn));
        Ok(syn)
    }

    pub fn new_syn_ack(conn: &RdpConnection) -> Result<Self> {
        let mut syn_ack = Self::new_syn(conn)?;
        syn_ack.flag |= RdpFlag::ACK;
        syn_ack.ack_number = conn.recv_vars.current_sequence_num;
        Ok(syn_ack)
    }

    pub fn new_ack(conn: &RdpConnection) -> Result<Self> {
        let mut ack = Self::new_base(conn)?;
        ack.flag |= RdpFlag::ACK;
        ack.seq_number = conn.send_vars.next_sequence_num;
        ack.ack_number = conn.recv_vars.current_sequence_num;
        Ok(ack)
    }

    pub fn new_eack(conn: &RdpConnection) -> Result<Self> {
        let mut eack = Self::new_ack(conn)?;
        eack.segment_type = RdpSegmentType::Eack(conn.eack_list());
        Ok(eack)
    }

    pub fn new_rst(conn: &RdpConnection) -> Result<Self> {
        let mut rst = Self::new_base(conn)?;
        rst.seq_number = conn.send_vars.next_sequence_num;
        rst.segment_type = RdpSegmentType::Rst;
        Ok(rst)
    }

    pub fn new_datagram(conn: &RdpConnection, queued: &SendSegment) -> Result<Self> {
        let mut datagram = Self::new_base(conn)?;
        datagram.flag |= RdpFlag::ACK;
        datagram.seq_number = queued.seq;
        datagram.ack_number = conn.recv_vars.current_sequence_num;
        if queued.nul {
            datagram.segment_type = RdpSegmentType::Nul;
        } else {
            datagram.payload = queued.payload.clone();
        }
        Ok(datagram)
    }

    pub fn print_general_info(&self) -> String {
        format!(
            "SEGINFO: SPORT={} DPORT={} SEQ={} ACK={} LENGTH={} FLAG={:?} TYPE={:?}",
            self.src_port,
            self.dst_port,
            self.seq_number,
            self.ack_number,
            self.payload.len(),
            self.flag,
            self.segment_type
        )
    }
}

fn calc_checksum(packet: &[u8]) -> u8 {
    let sum = packet
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != 16)
        .fold(0u8, |acc, (_, b)| acc.wrapping_add(*b));
    !sum
}
