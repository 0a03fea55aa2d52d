//! In-memory EtherCAT segment: a socket backed by a vector of simulated
//! slaves, each owning a register space, an EEPROM and a CoE mailbox server.
//!
//! The socket processes every sent frame synchronously, datagram by
//! datagram, circulating it through the slaves in ring order the way the
//! real bus does, and hands the circulated frame back on the next receive.
#![allow(dead_code)]


use etherbus::can::{
    self, CanService, CoeHeader, SdoHeader, SdoSegmentHeader, COE_HEADER_SIZE, EXPEDITED_MAX_SIZE,
    SDO_HEADER_SIZE, SDO_SEGMENT_HEADER_SIZE,
};
use etherbus::frame::{DatagramHeader, PduCommand, DATAGRAM_HEADER_SIZE, ETHERCAT_HEADER_SIZE};
use etherbus::mailbox::{MailboxHeader, MailboxType, MAILBOX_HEADER_SIZE};
use etherbus::registers::sm;
use etherbus::{EthercatSocket, PduData};

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::time::Duration;
use bilge::prelude::*;
use thiserror::Error;

/// register space of one simulated slave, mailbox buffers included
const MEMORY_SIZE: usize = 0x2000;

/// SDO abort codes the simulated slaves emit
pub const ABORT_NO_OBJECT: u32 = 0x0602_0000;
pub const ABORT_TOGGLE: u32 = 0x0503_0000;

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("malformed frame circulated on the segment")]
    MalformedFrame,
}

/// ongoing segmented upload served by a slave
struct UploadState {
    data: Vec<u8>,
    sent: usize,
    toggle: bool,
}

/// ongoing segmented download served by a slave
struct DownloadState {
    index: u16,
    sub: u8,
    received: Vec<u8>,
    toggle: bool,
}

/// one emulated slave device
pub struct SimSlave {
    memory: Vec<u8>,
    pub station_address: u16,

    eeprom: HashMap<u16, u32>,
    /// EEPROM address latched by the last request
    eeprom_address: u16,
    /// polls left answering busy after a request, then ready
    eeprom_remaining: u8,
    /// how many polls a request stays busy, to exercise the master's polling
    pub eeprom_busy_rounds: u8,

    recv_offset: u16,
    recv_size: u16,
    send_offset: u16,
    send_size: u16,

    /// frames ready to be read by the master
    send_queue: VecDeque<Vec<u8>>,
    /// object dictionary backing the CoE server
    pub dictionary: HashMap<(u16, u8), Vec<u8>>,
    upload: Option<UploadState>,
    download: Option<DownloadState>,
    emergency_counter: u8,

    /// invert the toggle bit of the next upload segment response
    pub corrupt_next_toggle: bool,
    /// refuse transitions to this state with this AL status code
    pub refuse_state: Option<(u8, u16)>,

    /// every raw mailbox frame the master wrote, for assertions
    pub mailbox_requests: Vec<Vec<u8>>,
}

impl SimSlave {
    pub fn new() -> Self {
        let mut slave = Self {
            memory: vec![0; MEMORY_SIZE],
            station_address: 0,
            eeprom: HashMap::new(),
            eeprom_address: 0,
            eeprom_remaining: 0,
            eeprom_busy_rounds: 1,
            recv_offset: 0x1000,
            recv_size: 128,
            send_offset: 0x1400,
            send_size: 128,
            send_queue: VecDeque::new(),
            dictionary: HashMap::new(),
            upload: None,
            download: None,
            emergency_counter: 0,
            corrupt_next_toggle: false,
            refuse_state: None,
            mailbox_requests: Vec::new(),
        };
        slave.with_identity(0x0000_0E11, 0x0001_0001, 0x0001_0000, 0xDEAD_0001);
        slave.sync_eeprom_mailbox();
        // CoE only
        slave.eeprom.insert(0x1C, 0x04);
        // 3 Kibit EEPROM, version 7
        slave.eeprom.insert(0x3E, 0x0007_0002);
        // powered up in INIT
        slave.memory[0x0130] = 1;
        slave
    }

    pub fn with_identity(&mut self, vendor: u32, product: u32, revision: u32, serial: u32) {
        self.eeprom.insert(0x08, vendor);
        self.eeprom.insert(0x0A, product);
        self.eeprom.insert(0x0C, revision);
        self.eeprom.insert(0x0E, serial);
    }

    pub fn with_mailbox(&mut self, recv_offset: u16, recv_size: u16, send_offset: u16, send_size: u16) {
        self.recv_offset = recv_offset;
        self.recv_size = recv_size;
        self.send_offset = send_offset;
        self.send_size = send_size;
        self.sync_eeprom_mailbox();
    }

    pub fn with_object(&mut self, index: u16, sub: u8, data: &[u8]) {
        self.dictionary.insert((index, sub), data.to_vec());
    }

    fn sync_eeprom_mailbox(&mut self) {
        self.eeprom.insert(
            0x18,
            u32::from(self.recv_offset) | (u32::from(self.recv_size) << 16),
        );
        self.eeprom.insert(
            0x1A,
            u32::from(self.send_offset) | (u32::from(self.send_size) << 16),
        );
    }

    /// queue an unsolicited emergency frame for the master to read
    pub fn queue_emergency(&mut self, error_code: u16, error_register: u8, data: [u8; 5]) {
        self.emergency_counter = self.emergency_counter % 7 + 1;
        let mut frame = vec![0u8; usize::from(self.send_size)];
        let header = MailboxHeader::new(
            can::EMERGENCY_SIZE as u16,
            0,
            u6::new(0),
            u2::new(0),
            u4::new(MailboxType::Can as u8),
            u3::new(self.emergency_counter),
        );
        header.pack(&mut frame).unwrap();
        CoeHeader::of(CanService::Emergency)
            .pack(&mut frame[MAILBOX_HEADER_SIZE..])
            .unwrap();
        let body = &mut frame[MAILBOX_HEADER_SIZE + COE_HEADER_SIZE..];
        body[..2].copy_from_slice(&error_code.to_le_bytes());
        body[2] = error_register;
        body[3..8].copy_from_slice(&data);
        self.send_queue.push_back(frame);
    }

    /// refresh the dynamic registers covered by a read of `len` bytes at `ado`
    fn materialize(&mut self, ado: u16, len: usize) {
        let range = usize::from(ado)..usize::from(ado) + len;

        // SM0 status: the simulated slave consumes its receive mailbox instantly
        let sm0_status = 0x0805;
        if range.contains(&sm0_status) {
            self.memory[sm0_status] = 0;
        }
        // SM1 status: full flag mirrors the send queue
        let sm1_status = 0x080D;
        if range.contains(&sm1_status) {
            self.memory[sm1_status] = if self.send_queue.is_empty() {
                0
            } else {
                sm::STATUS_MAILBOX_FULL
            };
        }
        // SII control word: busy until the configured rounds elapsed
        if range.contains(&0x0502) {
            let control: u16 = if self.eeprom_remaining > 0 {
                self.eeprom_remaining -= 1;
                0x8000
            } else {
                0
            };
            self.memory[0x0502..0x0504].copy_from_slice(&control.to_le_bytes());
        }
        // SII data register: the word at the latched address
        if range.contains(&0x0508) {
            let word = self.eeprom.get(&self.eeprom_address).copied().unwrap_or(0);
            self.memory[0x0508..0x050C].copy_from_slice(&word.to_le_bytes());
        }
        // send mailbox buffer: the front of the send queue
        let send = usize::from(self.send_offset);
        if range.start >= send && range.start < send + usize::from(self.send_size) {
            self.memory[send..send + usize::from(self.send_size)].fill(0);
            if let Some(frame) = self.send_queue.front() {
                self.memory[send..send + frame.len()].copy_from_slice(frame);
            }
        }
    }

    fn read(&mut self, ado: u16, out: &mut [u8]) {
        self.materialize(ado, out.len());
        let start = usize::from(ado);
        out.copy_from_slice(&self.memory[start..start + out.len()]);
        // a read of the send mailbox consumes the queued frame
        if ado == self.send_offset && !self.send_queue.is_empty() {
            self.send_queue.pop_front();
        }
    }

    fn write(&mut self, ado: u16, data: &[u8]) {
        let start = usize::from(ado);
        self.memory[start..start + data.len()].copy_from_slice(data);
        self.side_effects(ado, data.len());
    }

    /// registers with behavior attached
    fn side_effects(&mut self, ado: u16, len: usize) {
        match ado {
            // station address assignment
            0x0010 => {
                self.station_address =
                    u16::from_le_bytes(self.memory[0x0010..0x0012].try_into().unwrap());
            }
            // AL control: transition immediately, or refuse with an error flag
            0x0120 => {
                let request =
                    u16::from_le_bytes(self.memory[0x0120..0x0122].try_into().unwrap());
                let target = (request & 0xF) as u8;
                match self.refuse_state {
                    Some((refused, code)) if refused == target => {
                        self.memory[0x0130] |= 0x10;
                        self.memory[0x0134..0x0136].copy_from_slice(&code.to_le_bytes());
                    }
                    _ => {
                        self.memory[0x0130] = target;
                        self.memory[0x0131] = 0;
                        self.memory[0x0134..0x0136].fill(0);
                    }
                }
            }
            // SII request: latch the address, become busy
            0x0502 if len >= 6 => {
                self.eeprom_address =
                    u16::from_le_bytes(self.memory[0x0504..0x0506].try_into().unwrap());
                self.eeprom_remaining = self.eeprom_busy_rounds;
            }
            _ => {}
        }
        // a full write to the receive mailbox triggers the CoE server
        if ado == self.recv_offset && len == usize::from(self.recv_size) {
            let frame =
                self.memory[usize::from(ado)..usize::from(ado) + len].to_vec();
            self.mailbox_requests.push(frame.clone());
            self.serve_mailbox(&frame);
        }
    }

    /// CoE server: answer SDO requests, maintaining segmented transfer state
    fn serve_mailbox(&mut self, frame: &[u8]) {
        let Ok(header) = MailboxHeader::unpack(frame) else {
            return;
        };
        if !header.is(MailboxType::Can) {
            return;
        }
        let count = header.count().value();
        let length = usize::from(header.length());
        if MAILBOX_HEADER_SIZE + length > frame.len() {
            return;
        }
        let content = &frame[MAILBOX_HEADER_SIZE..MAILBOX_HEADER_SIZE + length];
        let Ok(coe) = CoeHeader::unpack(content) else {
            return;
        };
        if !coe.is(CanService::SdoRequest) {
            return;
        }
        let service = &content[COE_HEADER_SIZE..];
        let Some(&first) = service.first() else {
            return;
        };

        // the command specifier lives in the top 3 bits whatever the header layout
        match first >> 5 {
            can::command::UPLOAD_REQUEST => {
                let Ok(sdo) = SdoHeader::unpack(service) else {
                    return;
                };
                self.serve_upload(count, sdo)
            }
            can::command::UPLOAD_SEGMENT_REQUEST => self.serve_upload_segment(count, service),
            can::command::DOWNLOAD_REQUEST => {
                let Ok(sdo) = SdoHeader::unpack(service) else {
                    return;
                };
                self.serve_download(count, sdo, service)
            }
            can::command::DOWNLOAD_SEGMENT_REQUEST => {
                self.serve_download_segment(count, service, length)
            }
            _ => self.respond_abort(count, 0, 0, ABORT_NO_OBJECT),
        }
    }

    fn serve_upload(&mut self, count: u8, sdo: SdoHeader) {
        let key = (sdo.index(), sdo.sub());
        let Some(data) = self.dictionary.get(&key).cloned() else {
            self.respond_abort(count, sdo.index(), sdo.sub(), ABORT_NO_OBJECT);
            return;
        };
        if data.len() <= EXPEDITED_MAX_SIZE {
            self.respond_sdo(count, |service| {
                SdoHeader::new(
                    true,
                    true,
                    u2::new((EXPEDITED_MAX_SIZE - data.len()) as u8),
                    sdo.complete(),
                    u3::new(can::command::UPLOAD_RESPONSE),
                    sdo.index(),
                    sdo.sub(),
                )
                .pack(service)
                .unwrap();
                service[SDO_HEADER_SIZE..][..data.len()].copy_from_slice(&data);
                can::SDO_REQUEST_SIZE - COE_HEADER_SIZE
            });
        } else {
            // normal transfer: declare the size, serve the data in segments
            let total = data.len() as u32;
            self.upload = Some(UploadState {
                data,
                sent: 0,
                toggle: false,
            });
            self.respond_sdo(count, |service| {
                SdoHeader::new(
                    true,
                    false,
                    u2::new(0),
                    sdo.complete(),
                    u3::new(can::command::UPLOAD_RESPONSE),
                    sdo.index(),
                    sdo.sub(),
                )
                .pack(service)
                .unwrap();
                service[SDO_HEADER_SIZE..][..4].copy_from_slice(&total.to_le_bytes());
                can::SDO_REQUEST_SIZE - COE_HEADER_SIZE
            });
        }
    }

    fn serve_upload_segment(&mut self, count: u8, service: &[u8]) {
        let Ok(request) = SdoSegmentHeader::unpack(service) else {
            return;
        };
        let capacity =
            usize::from(self.send_size) - MAILBOX_HEADER_SIZE - COE_HEADER_SIZE - SDO_SEGMENT_HEADER_SIZE;
        let Some(state) = self.upload.as_mut() else {
            return;
        };
        if request.toggle() != state.toggle {
            self.upload = None;
            self.respond_abort(count, 0, 0, ABORT_TOGGLE);
            return;
        }
        let chunk: Vec<u8> = state.data[state.sent..]
            .iter()
            .copied()
            .take(capacity)
            .collect();
        state.sent += chunk.len();
        let more = state.sent < state.data.len();
        let mut toggle = state.toggle;
        state.toggle = !state.toggle;
        if !more {
            self.upload = None;
        }
        if self.corrupt_next_toggle {
            self.corrupt_next_toggle = false;
            toggle = !toggle;
        }
        self.respond_sdo(count, |service| {
            SdoSegmentHeader::new(
                more,
                u3::new(7u8.saturating_sub(chunk.len() as u8).min(7)),
                toggle,
                u3::new(can::command::UPLOAD_SEGMENT_RESPONSE),
            )
            .pack(service)
            .unwrap();
            service[SDO_SEGMENT_HEADER_SIZE..][..chunk.len()].copy_from_slice(&chunk);
            SDO_SEGMENT_HEADER_SIZE + chunk.len()
        });
    }

    fn serve_download(&mut self, count: u8, sdo: SdoHeader, service: &[u8]) {
        let key = (sdo.index(), sdo.sub());
        if sdo.expedited() {
            let size = if sdo.sized() {
                EXPEDITED_MAX_SIZE - usize::from(sdo.size().value())
            } else {
                EXPEDITED_MAX_SIZE
            };
            let data = service[SDO_HEADER_SIZE..][..size].to_vec();
            self.dictionary.insert(key, data);
        } else {
            self.download = Some(DownloadState {
                index: sdo.index(),
                sub: sdo.sub(),
                received: Vec::new(),
                toggle: false,
            });
        }
        self.respond_sdo(count, |out| {
            SdoHeader::new(
                false,
                false,
                u2::new(0),
                sdo.complete(),
                u3::new(can::command::DOWNLOAD_RESPONSE),
                sdo.index(),
                sdo.sub(),
            )
            .pack(out)
            .unwrap();
            can::SDO_REQUEST_SIZE - COE_HEADER_SIZE
        });
    }

    fn serve_download_segment(&mut self, count: u8, service: &[u8], length: usize) {
        let Ok(request) = SdoSegmentHeader::unpack(service) else {
            return;
        };
        let Some(state) = self.download.as_mut() else {
            return;
        };
        if request.toggle() != state.toggle {
            self.download = None;
            self.respond_abort(count, 0, 0, ABORT_TOGGLE);
            return;
        }
        let data = &service[SDO_SEGMENT_HEADER_SIZE..length - COE_HEADER_SIZE];
        state.received.extend_from_slice(data);
        let toggle = state.toggle;
        state.toggle = !state.toggle;
        if !request.more() {
            let state = self.download.take().unwrap();
            self.dictionary
                .insert((state.index, state.sub), state.received);
        }
        self.respond_sdo(count, |out| {
            SdoSegmentHeader::new(
                false,
                u3::new(0),
                toggle,
                u3::new(can::command::DOWNLOAD_SEGMENT_RESPONSE),
            )
            .pack(out)
            .unwrap();
            SDO_SEGMENT_HEADER_SIZE
        });
    }

    fn respond_abort(&mut self, count: u8, index: u16, sub: u8, code: u32) {
        self.respond_sdo(count, |service| {
            SdoHeader::new(
                false,
                false,
                u2::new(0),
                false,
                u3::new(can::command::ABORT),
                index,
                sub,
            )
            .pack(service)
            .unwrap();
            service[SDO_HEADER_SIZE..][..4].copy_from_slice(&code.to_le_bytes());
            can::SDO_REQUEST_SIZE - COE_HEADER_SIZE
        });
    }

    /// wrap a CoE SDO service in a mailbox frame and queue it for the master
    fn respond_sdo(&mut self, count: u8, build: impl FnOnce(&mut [u8]) -> usize) {
        let mut frame = vec![0u8; usize::from(self.send_size)];
        let length = build(&mut frame[MAILBOX_HEADER_SIZE + COE_HEADER_SIZE..]);
        CoeHeader::of(CanService::SdoResponse)
            .pack(&mut frame[MAILBOX_HEADER_SIZE..])
            .unwrap();
        let header = MailboxHeader::new(
            (COE_HEADER_SIZE + length) as u16,
            0,
            u6::new(0),
            u2::new(0),
            u4::new(MailboxType::Can as u8),
            u3::new(count & 0x7),
        );
        header.pack(&mut frame).unwrap();
        self.send_queue.push_back(frame);
    }
}

/// the virtual segment: slaves in ring order plus the frame in flight
pub struct Segment {
    pub slaves: Vec<SimSlave>,
    replies: VecDeque<Vec<u8>>,
    /// every broadcast write in emission order, for byte-for-byte assertions
    pub broadcast_writes: Vec<(u16, Vec<u8>)>,
}

impl Segment {
    /// circulate one frame through every slave, datagram by datagram
    fn circulate(&mut self, frame: &mut [u8]) -> Result<(), SegmentError> {
        let mut offset = ETHERCAT_HEADER_SIZE;
        loop {
            if offset + DATAGRAM_HEADER_SIZE > frame.len() {
                return Err(SegmentError::MalformedFrame);
            }
            let mut header = DatagramHeader::unpack(&frame[offset..])
                .map_err(|_| SegmentError::MalformedFrame)?;
            let length = usize::from(header.length().value());
            let payload_at = offset + DATAGRAM_HEADER_SIZE;
            if payload_at + length + 2 > frame.len() {
                return Err(SegmentError::MalformedFrame);
            }

            let command = PduCommand::try_from(header.command())
                .map_err(|_| SegmentError::MalformedFrame)?;
            let mut address = header.address();
            let mut wkc =
                u16::from_le_bytes(frame[payload_at + length..payload_at + length + 2].try_into().unwrap());

            if command == PduCommand::BWR {
                self.broadcast_writes
                    .push((address as u16, frame[payload_at..payload_at + length].to_vec()));
            }

            for slave in &mut self.slaves {
                let adp = (address >> 16) as u16;
                let ado = address as u16;
                let payload = &mut frame[payload_at..payload_at + length];
                match command {
                    PduCommand::BRD => {
                        slave.read(ado, payload);
                        wkc += 1;
                    }
                    PduCommand::BWR => {
                        slave.write(ado, payload);
                        wkc += 1;
                    }
                    PduCommand::APRD | PduCommand::APWR | PduCommand::APRW => {
                        if adp == 0 {
                            exchange(slave, command != PduCommand::APWR, command != PduCommand::APRD, ado, payload);
                            wkc += 1;
                        }
                        // every slave increments the position field
                        address = (u32::from(adp.wrapping_add(1)) << 16) | u32::from(ado);
                    }
                    PduCommand::FPRD | PduCommand::FPWR | PduCommand::FPRW => {
                        if adp == slave.station_address {
                            exchange(slave, command != PduCommand::FPWR, command != PduCommand::FPRD, ado, payload);
                            wkc += 1;
                        }
                    }
                    _ => {}
                }
            }

            header.set_address(address);
            header.pack(&mut frame[offset..]).unwrap();
            frame[payload_at + length..payload_at + length + 2]
                .copy_from_slice(&wkc.to_le_bytes());

            if !header.more() {
                break;
            }
            offset = payload_at + length + 2;
        }
        Ok(())
    }
}

/// read and/or write one slave's memory, the way the RW commands exchange data in flight
fn exchange(slave: &mut SimSlave, read: bool, write: bool, ado: u16, payload: &mut [u8]) {
    let mut circulated = payload.to_vec();
    if read {
        slave.read(ado, &mut circulated);
    }
    if write {
        slave.write(ado, payload);
    }
    if read {
        payload.copy_from_slice(&circulated);
    }
}

/// socket handing sent frames to the virtual segment
pub struct VirtualSocket {
    pub segment: RefCell<Segment>,
}

impl VirtualSocket {
    pub fn new(slaves: Vec<SimSlave>) -> Self {
        Self {
            segment: RefCell::new(Segment {
                slaves,
                replies: VecDeque::new(),
                broadcast_writes: Vec::new(),
            }),
        }
    }
}

impl EthercatSocket for VirtualSocket {
    fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut segment = self.segment.borrow_mut();
        let mut frame = data.to_vec();
        segment
            .circulate(&mut frame)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        segment.replies.push_back(frame);
        Ok(())
    }

    fn receive(&self, data: &mut [u8]) -> io::Result<usize> {
        let frame = self
            .segment
            .borrow_mut()
            .replies
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "no frame on the segment"))?;
        data[..frame.len()].copy_from_slice(&frame);
        Ok(frame.len())
    }

    fn set_timeout(&self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }
}
