/*!
    Per-slave mailbox transport: a session-handle-counted request/response
    engine over the slave's sync-manager buffers.

    Messages created by the application wait in `to_send`, move to
    `to_process` once written to the slave, and are matched against incoming
    mailbox payloads by their session counter. A message consuming a payload
    decides its own fate: done, waiting for more segments, or listening
    forever (the emergency listener). Terminal messages are parked until the
    application reaps them through their [Token].
*/

use crate::can::{
    self, CanService, CoeHeader, Emergency, SdoHeader, SdoSegmentHeader, COE_HEADER_SIZE,
    EXPEDITED_MAX_SIZE, SDO_HEADER_SIZE, SDO_SEGMENT_HEADER_SIZE,
};
use crate::data::{bilge_pdudata_wide, PduData};
use crate::sdo::Sdo;
use bilge::prelude::*;
use std::collections::VecDeque;

/// byte length of [MailboxHeader]
pub const MAILBOX_HEADER_SIZE: usize = 6;

/// header prefixing every mailbox frame
/// ETG.1000.4 table 29
#[bitsize(48)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct MailboxHeader {
    /// byte length of the service data following this header
    pub length: u16,
    /// station address of the source (master as client) or destination (slave as client)
    pub address: u16,
    /// reserved for future use
    pub channel: u6,
    /// 0 is lowest priority, 3 is highest
    pub priority: u2,
    /// mailbox protocol, one of [MailboxType]
    pub ty: u4,
    /// session handle of the mailbox services, rolls from 1 to 7 and never takes 0
    pub count: u3,
    reserved: u1,
}
bilge_pdudata_wide!(MailboxHeader, u48, u64, 6);

impl MailboxHeader {
    pub fn is(&self, ty: MailboxType) -> bool {
        self.ty().value() == ty as u8
    }
}

/// mailbox protocols transported in a mailbox frame
/// ETG.1000.4 table 29
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum MailboxType {
    Exception = 0x0,
    Ads = 0x1,
    Ethernet = 0x2,
    Can = 0x3,
    File = 0x4,
    Servo = 0x5,
    Specific = 0xf,
}

/// verdict of a message offered an incoming mailbox payload
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProcessingResult {
    /// the payload is not related to this message
    Noop,
    /// the payload was consumed, the transfer needs another exchange
    Continue,
    /// the payload was consumed and the message reached a terminal status
    Finalize,
    /// the payload was consumed but the message keeps listening
    FinalizeAndKeep,
}

/// status of a mailbox message, terminal unless [Running](Self::Running)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MessageStatus {
    /// the exchange is not finished yet
    Running,
    Success,
    /// the reply used a CoE service inappropriate for the request
    WrongService,
    /// the reply used a CoE service this master does not know of
    UnknownService,
    /// the client buffer cannot hold the transferred data
    ClientBufferTooSmall,
    /// a segment came back with an unexpected toggle bit
    BadToggleBit,
    /// the slave aborted the SDO transfer with this code
    Abort(u32),
}

/// handle kept by the application to observe a message after it was queued
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Token(u32);

/// transfer-specific state of a message
enum MessageKind {
    SdoUpload {
        /// client buffer capacity
        capacity: usize,
        /// declared total size of a segmented transfer
        total: usize,
        toggle: bool,
        /// the initiate response was received, segments are expected
        segmented: bool,
    },
    SdoDownload {
        payload: Vec<u8>,
        sent: usize,
        toggle: bool,
        /// the initiate response was received, segments are being sent
        segmented: bool,
    },
    /// matches unsolicited CoE emergencies forever
    EmergencyListener,
}

/**
    one queued mailbox exchange

    owns its send buffer (mailbox header + service data), sized to the
    slave's receive mailbox so it can be written to the sync manager as-is
*/
pub struct Message {
    token: Token,
    counter: u8,
    status: MessageStatus,
    kind: MessageKind,
    request: Vec<u8>,
    /// received client data (upload result)
    data: Vec<u8>,
}

impl Message {
    pub fn token(&self) -> Token {
        self.token
    }
    pub fn status(&self) -> &MessageStatus {
        &self.status
    }
    /// full mailbox frame to write to the slave's receive mailbox
    pub fn request(&self) -> &[u8] {
        &self.request
    }
    /// client data received so far
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// stamp the session counter in the request header before transmission
    fn stamp(&mut self, counter: u8) {
        self.counter = counter;
        let mut header = MailboxHeader::unpack(&self.request).unwrap();
        header.set_count(u3::new(counter));
        header.pack(&mut self.request).unwrap();
    }

    /// rewrite the service data section, updating the header length
    fn set_service(&mut self, length: usize) {
        let mut header = MailboxHeader::unpack(&self.request).unwrap();
        header.set_length(length as u16);
        header.pack(&mut self.request).unwrap();
    }

    /// bytes available for one download segment in the request buffer
    fn segment_capacity(&self) -> usize {
        self.request.len() - MAILBOX_HEADER_SIZE - COE_HEADER_SIZE - SDO_SEGMENT_HEADER_SIZE
    }

    /**
        try to process an incoming mailbox payload

        returns [ProcessingResult::Noop] if the payload is not related to
        this message, so the engine can offer it to the next candidate
    */
    pub fn process(&mut self, payload: &[u8]) -> ProcessingResult {
        let Ok(header) = MailboxHeader::unpack(payload) else {
            return ProcessingResult::Noop;
        };
        let length = usize::from(header.length());
        if MAILBOX_HEADER_SIZE + length > payload.len() || length < COE_HEADER_SIZE {
            return ProcessingResult::Noop;
        }
        if !header.is(MailboxType::Can) {
            return ProcessingResult::Noop;
        }
        let content = &payload[MAILBOX_HEADER_SIZE..MAILBOX_HEADER_SIZE + length];
        let coe = match CoeHeader::unpack(content) {
            Ok(coe) => coe,
            Err(_) => return ProcessingResult::Noop,
        };

        if let MessageKind::EmergencyListener = self.kind {
            return if coe.is(CanService::Emergency) {
                ProcessingResult::FinalizeAndKeep
            } else {
                ProcessingResult::Noop
            };
        }

        // session correlation: replies carry the counter of their request
        if header.count().value() != self.counter {
            return ProcessingResult::Noop;
        }
        match CanService::try_from(coe.service().value()) {
            Ok(CanService::SdoResponse) => (),
            // let the emergency listener or the engine fallback take it
            Ok(CanService::Emergency) => return ProcessingResult::Noop,
            Ok(_) => {
                self.status = MessageStatus::WrongService;
                return ProcessingResult::Finalize;
            }
            Err(_) => {
                self.status = MessageStatus::UnknownService;
                return ProcessingResult::Finalize;
            }
        }

        let service = &content[COE_HEADER_SIZE..];
        if let Some(code) = try_abort(service) {
            self.status = MessageStatus::Abort(code);
            return ProcessingResult::Finalize;
        }

        match &self.kind {
            MessageKind::SdoUpload { segmented: false, .. } => self.process_upload(service),
            MessageKind::SdoUpload { segmented: true, .. } => {
                self.process_upload_segment(service)
            }
            MessageKind::SdoDownload { .. } => self.process_download(service),
            MessageKind::EmergencyListener => unreachable!(),
        }
    }

    /// initiate upload response: expedited data or the first block of a segmented transfer
    fn process_upload(&mut self, service: &[u8]) -> ProcessingResult {
        let (capacity, toggle) = match &self.kind {
            MessageKind::SdoUpload {
                capacity, toggle, ..
            } => (*capacity, *toggle),
            _ => unreachable!(),
        };
        let Ok(header) = SdoHeader::unpack(service) else {
            return ProcessingResult::Noop;
        };
        if header.command().value() != can::command::UPLOAD_RESPONSE {
            self.status = MessageStatus::WrongService;
            return ProcessingResult::Finalize;
        }

        let area = &service[SDO_HEADER_SIZE..];
        if header.expedited() {
            let size = if header.sized() {
                EXPEDITED_MAX_SIZE - usize::from(header.size().value())
            } else {
                EXPEDITED_MAX_SIZE
            };
            if size > capacity {
                self.status = MessageStatus::ClientBufferTooSmall;
                return ProcessingResult::Finalize;
            }
            self.data.extend_from_slice(&area[..size]);
            self.status = MessageStatus::Success;
            return ProcessingResult::Finalize;
        }

        // segmented transfer: the declared size then an optional first block
        let Ok(declared) = u32::unpack(area) else {
            return ProcessingResult::Noop;
        };
        let declared = declared as usize;
        if declared > capacity {
            self.status = MessageStatus::ClientBufferTooSmall;
            return ProcessingResult::Finalize;
        }
        let first = &area[4..];
        let first = &first[..first.len().min(declared)];
        self.data.extend_from_slice(first);
        if self.data.len() >= declared {
            self.status = MessageStatus::Success;
            return ProcessingResult::Finalize;
        }
        if let MessageKind::SdoUpload {
            total, segmented, ..
        } = &mut self.kind
        {
            *total = declared;
            *segmented = true;
        }
        let length = can::upload_segment_request(&mut self.request[MAILBOX_HEADER_SIZE..], toggle);
        self.set_service(length);
        ProcessingResult::Continue
    }

    /// one segment of a segmented upload
    fn process_upload_segment(&mut self, service: &[u8]) -> ProcessingResult {
        let (capacity, total, toggle) = match &self.kind {
            MessageKind::SdoUpload {
                capacity,
                total,
                toggle,
                ..
            } => (*capacity, *total, *toggle),
            _ => unreachable!(),
        };
        let Ok(header) = SdoSegmentHeader::unpack(service) else {
            return ProcessingResult::Noop;
        };
        if header.command().value() != can::command::UPLOAD_SEGMENT_RESPONSE {
            self.status = MessageStatus::WrongService;
            return ProcessingResult::Finalize;
        }
        if header.toggle() != toggle {
            self.status = MessageStatus::BadToggleBit;
            return ProcessingResult::Finalize;
        }

        let chunk = &service[SDO_SEGMENT_HEADER_SIZE..];
        let chunk = &chunk[..chunk.len().min(total - self.data.len())];
        if self.data.len() + chunk.len() > capacity {
            self.status = MessageStatus::ClientBufferTooSmall;
            return ProcessingResult::Finalize;
        }
        self.data.extend_from_slice(chunk);

        if header.more() && self.data.len() < total {
            let next = !toggle;
            if let MessageKind::SdoUpload { toggle, .. } = &mut self.kind {
                *toggle = next;
            }
            let length =
                can::upload_segment_request(&mut self.request[MAILBOX_HEADER_SIZE..], next);
            self.set_service(length);
            ProcessingResult::Continue
        } else {
            self.status = MessageStatus::Success;
            ProcessingResult::Finalize
        }
    }

    /// initiate download acknowledge or one segment acknowledge
    fn process_download(&mut self, service: &[u8]) -> ProcessingResult {
        let segment_capacity = self.segment_capacity();
        let (payload_len, sent, toggle, segmented) = match &self.kind {
            MessageKind::SdoDownload {
                payload,
                sent,
                toggle,
                segmented,
            } => (payload.len(), *sent, *toggle, *segmented),
            _ => unreachable!(),
        };

        if !segmented {
            let Ok(header) = SdoHeader::unpack(service) else {
                return ProcessingResult::Noop;
            };
            if header.command().value() != can::command::DOWNLOAD_RESPONSE {
                self.status = MessageStatus::WrongService;
                return ProcessingResult::Finalize;
            }
            if payload_len <= EXPEDITED_MAX_SIZE {
                // expedited acknowledge, nothing more to transfer
                self.status = MessageStatus::Success;
                return ProcessingResult::Finalize;
            }
            // acknowledge of the initiate request, send the first segment
            return self.next_download_segment(0, false, segment_capacity);
        }

        let Ok(header) = SdoSegmentHeader::unpack(service) else {
            return ProcessingResult::Noop;
        };
        if header.command().value() != can::command::DOWNLOAD_SEGMENT_RESPONSE {
            self.status = MessageStatus::WrongService;
            return ProcessingResult::Finalize;
        }
        if header.toggle() != toggle {
            self.status = MessageStatus::BadToggleBit;
            return ProcessingResult::Finalize;
        }

        if sent >= payload_len {
            self.status = MessageStatus::Success;
            return ProcessingResult::Finalize;
        }
        self.next_download_segment(sent, !toggle, segment_capacity)
    }

    /// build the next download segment request starting at `offset`
    fn next_download_segment(
        &mut self,
        offset: usize,
        toggle: bool,
        segment_capacity: usize,
    ) -> ProcessingResult {
        let (chunk, more) = match &self.kind {
            MessageKind::SdoDownload { payload, .. } => {
                let chunk = &payload[offset..];
                let chunk = &chunk[..segment_capacity.min(chunk.len())];
                (chunk.to_vec(), offset + chunk.len() < payload.len())
            }
            _ => unreachable!(),
        };
        if let MessageKind::SdoDownload {
            sent,
            toggle: state,
            segmented,
            ..
        } = &mut self.kind
        {
            *sent = offset + chunk.len();
            *state = toggle;
            *segmented = true;
        }
        let length = can::download_segment_request(
            &mut self.request[MAILBOX_HEADER_SIZE..],
            &chunk,
            toggle,
            more,
        );
        self.set_service(length);
        ProcessingResult::Continue
    }
}

/// parse an abort service, returning its code
fn try_abort(service: &[u8]) -> Option<u32> {
    let header = SdoHeader::unpack(service).ok()?;
    if header.command().value() == can::command::ABORT {
        u32::unpack(&service[SDO_HEADER_SIZE..]).ok()
    } else {
        None
    }
}

/// decode an unsolicited emergency frame
fn decode_emergency(payload: &[u8]) -> Option<Emergency> {
    let header = MailboxHeader::unpack(payload).ok()?;
    if !header.is(MailboxType::Can) {
        return None;
    }
    let length = usize::from(header.length());
    if MAILBOX_HEADER_SIZE + length > payload.len() || length < can::EMERGENCY_SIZE {
        return None;
    }
    let content = &payload[MAILBOX_HEADER_SIZE..];
    let coe = CoeHeader::unpack(content).ok()?;
    if !coe.is(CanService::Emergency) {
        return None;
    }
    Emergency::unpack(&content[COE_HEADER_SIZE..]).ok()
}

/**
    mailbox transport engine of one slave

    owns the message queues and the session counter. The bus controller
    drives it: [send](Self::send) yields the next frame to write to the
    slave, [receive](Self::receive) dispatches a frame read from the slave.
*/
pub struct Mailbox {
    /// byte size of the slave's receive mailbox, set when the sync managers are configured
    capacity: usize,
    counter: u8,
    to_send: VecDeque<Message>,
    to_process: Vec<Message>,
    done: Vec<Message>,
    emergencies: Vec<Emergency>,
    next_token: u32,
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            capacity: 0,
            counter: 0,
            to_send: VecDeque::new(),
            to_process: Vec::new(),
            done: Vec::new(),
            emergencies: Vec::new(),
            next_token: 0,
        }
    }

    /// declare the byte size of the slave's receive mailbox
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// next session handle: 1 to 7, never 0, never twice the same in a row
    pub fn next_counter(&mut self) -> u8 {
        self.counter = self.counter % 7 + 1;
        self.counter
    }

    /// true if a message waits to be written to the slave
    pub fn pending(&self) -> bool {
        !self.to_send.is_empty()
    }

    /// emergencies received so far
    pub fn emergencies(&self) -> &[Emergency] {
        &self.emergencies
    }

    fn allocate(&mut self, kind: MessageKind, service: impl FnOnce(&mut [u8]) -> usize) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;

        let mut request = vec![0; self.capacity.max(MAILBOX_HEADER_SIZE + can::SDO_REQUEST_SIZE)];
        let length = service(&mut request[MAILBOX_HEADER_SIZE..]);
        let header = MailboxHeader::new(
            length as u16,
            0,
            u6::new(0),
            u2::new(0),
            u4::new(MailboxType::Can as u8),
            u3::new(0),
        );
        header.pack(&mut request).unwrap();

        self.to_send.push_back(Message {
            token,
            counter: 0,
            status: MessageStatus::Running,
            kind,
            request,
            data: Vec::new(),
        });
        token
    }

    /// queue an SDO upload, `capacity` bounding the expected data size
    pub fn sdo_upload(&mut self, sdo: Sdo, capacity: usize) -> Token {
        self.allocate(
            MessageKind::SdoUpload {
                capacity,
                total: 0,
                toggle: false,
                segmented: false,
            },
            |dst| can::upload_request(dst, sdo),
        )
    }

    /// queue an SDO download of the given payload
    pub fn sdo_download(&mut self, sdo: Sdo, payload: &[u8]) -> Token {
        let expedited = payload.len() <= EXPEDITED_MAX_SIZE;
        let owned = payload.to_vec();
        self.allocate(
            MessageKind::SdoDownload {
                payload: owned,
                sent: 0,
                toggle: false,
                segmented: false,
            },
            |dst| {
                if expedited {
                    can::download_expedited_request(dst, sdo, payload)
                } else {
                    can::download_normal_request(dst, sdo, payload.len() as u32)
                }
            },
        )
    }

    /// keep a listener in the processing list so unsolicited emergencies are always consumed
    pub fn attach_emergency_listener(&mut self) {
        if self
            .to_process
            .iter()
            .any(|msg| matches!(msg.kind, MessageKind::EmergencyListener))
        {
            return;
        }
        let token = Token(self.next_token);
        self.next_token += 1;
        self.to_process.push(Message {
            token,
            counter: 0,
            status: MessageStatus::Running,
            kind: MessageKind::EmergencyListener,
            request: vec![0; MAILBOX_HEADER_SIZE],
            data: Vec::new(),
        });
    }

    /**
        pop the next message to transmit, stamped with a fresh session counter

        the message is moved to the processing list, the returned reference is
        there for the caller to write [Message::request] to the slave
    */
    pub fn send(&mut self) -> Option<&Message> {
        let mut message = self.to_send.pop_front()?;
        let counter = self.next_counter();
        message.stamp(counter);
        self.to_process.push(message);
        self.to_process.last()
    }

    /**
        dispatch a raw mailbox payload read from the slave

        the first message of the processing list accepting it wins; an
        emergency matched by no one is appended to the emergency buffer.
        returns false if nothing consumed the payload.
    */
    pub fn receive(&mut self, payload: &[u8]) -> bool {
        let mut action = None;
        for (position, message) in self.to_process.iter_mut().enumerate() {
            match message.process(payload) {
                ProcessingResult::Noop => continue,
                result => {
                    action = Some((position, result));
                    break;
                }
            }
        }
        match action {
            Some((position, ProcessingResult::Finalize)) => {
                let message = self.to_process.remove(position);
                self.done.push(message);
                true
            }
            Some((position, ProcessingResult::Continue)) => {
                let message = self.to_process.remove(position);
                self.to_send.push_back(message);
                true
            }
            Some((_, ProcessingResult::FinalizeAndKeep)) => {
                if let Some(emergency) = decode_emergency(payload) {
                    self.emergencies.push(emergency);
                }
                true
            }
            Some((_, ProcessingResult::Noop)) => unreachable!(),
            None => {
                // unsolicited emergency with no listener attached
                if let Some(emergency) = decode_emergency(payload) {
                    self.emergencies.push(emergency);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// status of a message, wherever it is in its lifecycle
    pub fn status(&self, token: Token) -> Option<MessageStatus> {
        self.to_send
            .iter()
            .chain(self.to_process.iter())
            .chain(self.done.iter())
            .find(|msg| msg.token == token)
            .map(|msg| *msg.status())
    }

    /// reap a terminal message, returning the client data it received
    pub fn take_data(&mut self, token: Token) -> Option<Vec<u8>> {
        let position = self.done.iter().position(|msg| msg.token == token)?;
        Some(self.done.remove(position).data)
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}
