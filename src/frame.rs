/*!
    Encoding/decoding of ethercat frames and datagram batching in a fixed-capacity buffer.

    An ethercat frame is a 2-byte header followed by 1 to [MAX_ETHERCAT_DATAGRAMS]
    datagrams, each made of a 10-byte header, a payload, and a trailing 16-bit
    working counter incremented by every slave that processed the datagram.
    The ethernet encapsulation is left to the [socket](crate::socket) layer.
*/

use crate::data::{bilge_pdudata, bilge_pdudata_wide, PduData};
use crate::error::{EthercatError, EthercatResult};
use crate::socket::EthercatSocket;
use bilge::prelude::*;

/// maximum number of datagrams in one ethercat frame
pub const MAX_ETHERCAT_DATAGRAMS: usize = 15;
/// maximum byte length of one ethercat frame (bounded by the ethernet MTU)
pub const MAX_ETHERCAT_FRAME: usize = 1500;

/// byte length of [EthercatHeader]
pub const ETHERCAT_HEADER_SIZE: usize = 2;
/// byte length of [DatagramHeader]
pub const DATAGRAM_HEADER_SIZE: usize = 10;
/// byte length of the trailing working counter
pub const WKC_SIZE: usize = 2;

/// frame type announcing datagrams, in the ethercat header type field
const ETHERCAT_TYPE_PDU: u4 = u4::new(0x1);

/// header prefixing the datagrams in an ethercat frame
/// ETG.1000.4 table 25
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct EthercatHeader {
    /// byte length of the frame content after this header
    pub length: u11,
    reserved: u1,
    /// type of the frame content, 0x1 for datagrams
    pub ty: u4,
}
bilge_pdudata!(EthercatHeader, u16);

/// header of one datagram in an ethercat frame
/// ETG.1000.4 table 26
#[bitsize(80)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct DatagramHeader {
    /// command opcode, one of [PduCommand]
    pub command: u8,
    /// index stamped by the master to correlate the reply with the issuer
    pub index: u8,
    /// packed slave address and register offset, see [SlaveAddress::physical]
    pub address: u32,
    /// byte length of the payload
    pub length: u11,
    reserved: u3,
    /// set by the bus when the datagram circulated once already
    pub circulating: bool,
    /// another datagram follows in the same frame
    pub more: bool,
    /// event requests latched by the slaves
    pub irq: u16,
}
bilge_pdudata_wide!(DatagramHeader, u80, u128, 10);

/// the possible datagram commands
#[derive(Default, Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum PduCommand {
    /// no operation
    #[default]
    NOP = 0x00,

    /// auto-incremented read
    APRD = 0x01,
    /// auto-incremented write
    APWR = 0x02,
    /// auto-incremented read & write
    APRW = 0x03,

    /// fixed-address read
    FPRD = 0x04,
    /// fixed-address write
    FPWR = 0x05,
    /// fixed-address read & write
    FPRW = 0x06,

    /// broadcast read
    BRD = 0x07,
    /// broadcast write
    BWR = 0x08,
    /// broadcast read & write
    BRW = 0x09,

    /// logical memory read
    LRD = 0x0A,
    /// logical memory write
    LWR = 0x0B,
    /// logical memory read & write
    LRW = 0x0C,

    /// auto-incremented read & multiple write
    ARMW = 0x0D,
    /// fixed-address read & multiple write
    FRMW = 0x0E,
}

impl TryFrom<u8> for PduCommand {
    type Error = crate::data::PackingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Self::NOP,
            0x01 => Self::APRD,
            0x02 => Self::APWR,
            0x03 => Self::APRW,
            0x04 => Self::FPRD,
            0x05 => Self::FPWR,
            0x06 => Self::FPRW,
            0x07 => Self::BRD,
            0x08 => Self::BWR,
            0x09 => Self::BRW,
            0x0A => Self::LRD,
            0x0B => Self::LWR,
            0x0C => Self::LRW,
            0x0D => Self::ARMW,
            0x0E => Self::FRMW,
            _ => return Err(crate::data::PackingError::InvalidValue("no such command")),
        })
    }
}

/// dynamically specifies a destination on the ethercat segment
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlaveAddress {
    /// every slave will receive and execute
    Broadcast,
    /// the destination is determined by the topological position of the slave in the segment
    AutoIncremented(u16),
    /// the station address assigned to the slave by the master during bring-up
    Fixed(u16),
}

impl SlaveAddress {
    /// ADP half of the datagram address field
    pub fn adp(self) -> u16 {
        match self {
            Self::Broadcast => 0,
            Self::AutoIncremented(position) => 0u16.wrapping_sub(position),
            Self::Fixed(address) => address,
        }
    }
    /// pack this address with a register offset into the 32-bit datagram address field
    pub fn physical(self, ado: u16) -> u32 {
        (u32::from(self.adp()) << 16) | u32::from(ado)
    }
}

/**
    a fixed-capacity buffer accumulating datagrams until transmission

    After [write_then_read](Self::write_then_read) the buffer holds the reply
    frame, and [next_datagram](Self::next_datagram) pops the reply datagrams
    in the order they were added.
*/
pub struct Frame {
    buffer: [u8; MAX_ETHERCAT_FRAME],
    /// bytes used, ethercat header included
    len: usize,
    datagrams: u8,
    /// offset of the last datagram header, to maintain its `more` flag
    last_header: usize,
    /// reply iteration cursor
    read: usize,
    consumed: u8,
}

impl Frame {
    pub fn new() -> Self {
        Self {
            buffer: [0; MAX_ETHERCAT_FRAME],
            len: ETHERCAT_HEADER_SIZE,
            datagrams: 0,
            last_header: 0,
            read: ETHERCAT_HEADER_SIZE,
            consumed: 0,
        }
    }

    /// number of datagrams currently in the frame
    pub fn datagram_count(&self) -> u8 {
        self.datagrams
    }

    /// number of reply datagrams not consumed yet
    pub fn remaining_replies(&self) -> u8 {
        self.datagrams - self.consumed
    }

    /// bytes still available for datagrams
    pub fn free_space(&self) -> usize {
        MAX_ETHERCAT_FRAME - self.len
    }

    /// forget the frame content, ready for a new batch
    pub fn clear(&mut self) {
        self.len = ETHERCAT_HEADER_SIZE;
        self.datagrams = 0;
        self.last_header = 0;
        self.read = ETHERCAT_HEADER_SIZE;
        self.consumed = 0;
    }

    /**
        append one datagram to the frame

        `data` is the payload to transmit; when shorter than `length` (or
        absent, for read commands) the rest of the payload is zeroed.
        Fails with [EthercatError::FrameFull] when the datagram budget or the
        free space is exhausted.
    */
    pub fn add_datagram(
        &mut self,
        index: u8,
        command: PduCommand,
        address: u32,
        data: Option<&[u8]>,
        length: u16,
    ) -> EthercatResult<()> {
        let needed = DATAGRAM_HEADER_SIZE + usize::from(length) + WKC_SIZE;
        if usize::from(self.datagrams) == MAX_ETHERCAT_DATAGRAMS || self.free_space() < needed {
            return Err(EthercatError::FrameFull);
        }

        if self.datagrams > 0 {
            // the previous datagram announces this one
            let mut previous = DatagramHeader::unpack(&self.buffer[self.last_header..])?;
            previous.set_more(true);
            previous.pack(&mut self.buffer[self.last_header..])?;
        }

        let header = DatagramHeader::new(
            command as u8,
            index,
            address,
            u11::new(length),
            false,
            false,
            0,
        );
        header.pack(&mut self.buffer[self.len..])?;

        let payload = &mut self.buffer[self.len + DATAGRAM_HEADER_SIZE..][..usize::from(length)];
        match data {
            Some(data) => {
                let copied = data.len().min(payload.len());
                payload[..copied].copy_from_slice(&data[..copied]);
                payload[copied..].fill(0);
            }
            None => payload.fill(0),
        }
        // working counter starts at zero
        self.buffer[self.len + DATAGRAM_HEADER_SIZE + usize::from(length)..][..WKC_SIZE].fill(0);

        self.last_header = self.len;
        self.len += needed;
        self.datagrams += 1;
        Ok(())
    }

    /**
        transmit the frame and wait for its circulated counterpart

        On return the buffer holds the reply frame, parsed in place, and the
        reply datagrams can be popped with [next_datagram](Self::next_datagram).
    */
    pub fn write_then_read<S: EthercatSocket>(&mut self, socket: &S) -> EthercatResult<()> {
        if self.datagrams == 0 {
            return Err(EthercatError::Master("cannot transmit an empty frame"));
        }

        let header = EthercatHeader::new(
            u11::new((self.len - ETHERCAT_HEADER_SIZE) as u16),
            ETHERCAT_TYPE_PDU,
        );
        header.pack(&mut self.buffer[..ETHERCAT_HEADER_SIZE])?;

        socket.send(&self.buffer[..self.len])?;
        let received = socket.receive(&mut self.buffer)?;

        let reply = EthercatHeader::unpack(&self.buffer[..ETHERCAT_HEADER_SIZE])?;
        if usize::from(reply.length().value()) + ETHERCAT_HEADER_SIZE > received {
            return Err(EthercatError::Protocol("truncated ethercat frame received"));
        }

        self.read = ETHERCAT_HEADER_SIZE;
        self.consumed = 0;
        Ok(())
    }

    /// pop the next reply datagram, in the order the datagrams were added
    pub fn next_datagram(&mut self) -> EthercatResult<(DatagramHeader, &[u8], u16)> {
        if self.consumed >= self.datagrams {
            return Err(EthercatError::Master("no reply datagram left in frame"));
        }

        let start = self.read;
        let header = DatagramHeader::unpack(&self.buffer[start..])?;
        let length = usize::from(header.length().value());
        let end = start + DATAGRAM_HEADER_SIZE + length + WKC_SIZE;
        if end > MAX_ETHERCAT_FRAME {
            return Err(EthercatError::Protocol("datagram exceeds frame bounds"));
        }
        let wkc = u16::unpack(&self.buffer[start + DATAGRAM_HEADER_SIZE + length..])?;

        self.read = end;
        self.consumed += 1;
        let payload = &self.buffer[start + DATAGRAM_HEADER_SIZE..][..length];
        Ok((header, payload, wkc))
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::time::Duration;

    /// socket echoing back the last sent frame, as an ideal bus with zero slaves would
    struct EchoSocket {
        frame: RefCell<Vec<u8>>,
    }

    impl EchoSocket {
        fn new() -> Self {
            Self {
                frame: RefCell::new(Vec::new()),
            }
        }
    }

    impl EthercatSocket for EchoSocket {
        fn send(&self, data: &[u8]) -> std::io::Result<()> {
            *self.frame.borrow_mut() = data.to_vec();
            Ok(())
        }
        fn receive(&self, data: &mut [u8]) -> std::io::Result<usize> {
            let frame = self.frame.borrow();
            data[..frame.len()].copy_from_slice(&frame);
            Ok(frame.len())
        }
        fn set_timeout(&self, _timeout: Duration) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn datagram_header_layout() {
        let header = DatagramHeader::new(
            PduCommand::FPRD as u8,
            0x42,
            SlaveAddress::Fixed(0x1001).physical(0x0130),
            u11::new(2),
            false,
            true,
            0,
        );
        let mut buffer = [0u8; DATAGRAM_HEADER_SIZE];
        header.pack(&mut buffer).unwrap();
        assert_eq!(buffer[0], 0x04); // command
        assert_eq!(buffer[1], 0x42); // index
        assert_eq!(&buffer[2..6], &[0x30, 0x01, 0x01, 0x10]); // (adp << 16) | ado, little endian
        assert_eq!(buffer[6], 0x02); // length low bits
        assert_eq!(buffer[7], 0x80); // more flag is the top bit
        let parsed = DatagramHeader::unpack(&buffer).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn replies_come_back_in_issue_order() {
        let socket = EchoSocket::new();
        let mut frame = Frame::new();
        for index in 0..5u8 {
            frame
                .add_datagram(
                    index,
                    PduCommand::BRD,
                    SlaveAddress::Broadcast.physical(0),
                    Some(&[index]),
                    1,
                )
                .unwrap();
        }
        frame.write_then_read(&socket).unwrap();
        for index in 0..5u8 {
            let (header, payload, wkc) = frame.next_datagram().unwrap();
            assert_eq!(header.index(), index);
            assert_eq!(payload, &[index]);
            assert_eq!(wkc, 0);
            assert_eq!(header.more(), index != 4);
        }
        assert!(frame.next_datagram().is_err());
    }

    #[test]
    fn datagram_budget_is_enforced() {
        let mut frame = Frame::new();
        for index in 0..MAX_ETHERCAT_DATAGRAMS {
            frame
                .add_datagram(index as u8, PduCommand::BRD, 0, None, 1)
                .unwrap();
        }
        assert!(matches!(
            frame.add_datagram(15, PduCommand::BRD, 0, None, 1),
            Err(EthercatError::FrameFull)
        ));
        frame.clear();
        assert_eq!(frame.datagram_count(), 0);
        frame.add_datagram(0, PduCommand::BRD, 0, None, 1).unwrap();
    }

    #[test]
    fn free_space_is_enforced() {
        let mut frame = Frame::new();
        // a frame can hold one maximal datagram but not two
        let huge = (frame.free_space() - DATAGRAM_HEADER_SIZE - WKC_SIZE) as u16 - 100;
        frame
            .add_datagram(0, PduCommand::BWR, 0, None, huge)
            .unwrap();
        assert!(matches!(
            frame.add_datagram(1, PduCommand::BWR, 0, None, huge),
            Err(EthercatError::FrameFull)
        ));
    }
}
