/*!
    Bus controller: discovers the slaves, brings them through the state
    machine up to PRE-OP, and drives the acyclic mailbox traffic.

    The controller owns the slave vector and the link pipeline. It is the
    single bus-cycle driver: all its operations block on the socket inside
    the link and at bounded sleeps while polling the EEPROM interface or an
    AL state change.
*/

use crate::data::PduData;
use crate::error::{EthercatError, EthercatResult};
use crate::frame::{PduCommand, SlaveAddress};
use crate::link::{Answer, Link};
use crate::mailbox::{MessageStatus, Token};
use crate::registers::{
    self, sm, AlControlRequest, AlError, AlState, MailboxSupport, SiiControl, SiiRequest,
    SyncManagerChannel,
};
use crate::sdo::Sdo;
use crate::sii;
use crate::slave::Slave;
use crate::socket::EthercatSocket;
use bilge::prelude::*;
use log::{debug, info, warn};
use std::thread;
use std::time::{Duration, Instant};

/// timing and retry budgets of the bus controller
#[derive(Copy, Clone, Debug)]
pub struct BusConfig {
    /// socket receive timeout, also bounding every `write_then_read`
    pub receive_timeout: Duration,
    /// pause between two EEPROM readiness polls
    pub eeprom_poll: Duration,
    /// maximum number of EEPROM readiness polls before giving up
    pub eeprom_retries: usize,
    /// maximum time to wait for a requested AL state
    pub state_timeout: Duration,
    /// pause between two AL status polls
    pub state_poll: Duration,
    /// maximum number of mailbox cycles to wait for one message completion
    pub mailbox_cycles: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_millis(10),
            eeprom_poll: Duration::from_micros(200),
            eeprom_retries: 10,
            state_timeout: Duration::from_secs(10),
            state_poll: Duration::from_millis(1),
            mailbox_cycles: 64,
        }
    }
}

/// selects which slave field an EEPROM word updates, keeping the readout allocation-free
#[derive(Copy, Clone, Debug)]
enum EepromWord {
    VendorId,
    ProductCode,
    RevisionNumber,
    SerialNumber,
    RecvMailbox,
    SendMailbox,
    MailboxProtocol,
    EepromSize,
}

impl EepromWord {
    /// address of the word in the slave EEPROM
    fn address(self) -> u16 {
        match self {
            Self::VendorId => sii::VENDOR_ID,
            Self::ProductCode => sii::PRODUCT_CODE,
            Self::RevisionNumber => sii::REVISION_NUMBER,
            Self::SerialNumber => sii::SERIAL_NUMBER,
            Self::RecvMailbox => sii::STANDARD_MAILBOX + sii::RECV_MAILBOX_OFFSET,
            Self::SendMailbox => sii::STANDARD_MAILBOX + sii::SEND_MAILBOX_OFFSET,
            Self::MailboxProtocol => sii::MAILBOX_PROTOCOL,
            Self::EepromSize => sii::EEPROM_SIZE,
        }
    }

    /// store the word read from a slave EEPROM in the matching slave field
    fn apply(self, slave: &mut Slave, word: u32) {
        match self {
            Self::VendorId => slave.vendor_id = word,
            Self::ProductCode => slave.product_code = word,
            Self::RevisionNumber => slave.revision_number = word,
            Self::SerialNumber => slave.serial_number = word,
            Self::RecvMailbox => {
                slave.mailbox_config.recv_offset = word as u16;
                slave.mailbox_config.recv_size = (word >> 16) as u16;
            }
            Self::SendMailbox => {
                slave.mailbox_config.send_offset = word as u16;
                slave.mailbox_config.send_size = (word >> 16) as u16;
            }
            Self::MailboxProtocol => {
                slave.supported_mailbox = MailboxSupport::from(word as u16);
            }
            Self::EepromSize => {
                slave.eeprom_size = sii::eeprom_size_bytes(word);
                slave.eeprom_version = sii::eeprom_version(word);
            }
        }
    }
}

/**
    EtherCAT master core addressing a whole segment

    owns the link pipeline and the slave vector. Created empty, populated by
    [init](Self::init), then driven cycle by cycle with
    [process_mailboxes](Self::process_mailboxes) or the SDO helpers.
*/
pub struct Bus<S: EthercatSocket> {
    link: Link<S>,
    slaves: Vec<Slave>,
    config: BusConfig,
}

impl<S: EthercatSocket> Bus<S> {
    pub fn new(socket: S) -> Self {
        Self::with_config(socket, BusConfig::default())
    }

    pub fn with_config(socket: S, config: BusConfig) -> Self {
        Self {
            link: Link::new(socket),
            slaves: Vec::new(),
            config,
        }
    }

    /// access to the underlying socket
    pub fn socket(&self) -> &S {
        self.link.socket()
    }

    /// consume the bus, releasing the underlying socket
    pub fn into_socket(self) -> S {
        self.link.into_socket()
    }

    /// slaves discovered on the segment, in topological order
    pub fn slaves(&self) -> &[Slave] {
        &self.slaves
    }
    pub fn slaves_mut(&mut self) -> &mut [Slave] {
        &mut self.slaves
    }
    /// number of slaves discovered on the segment
    pub fn slave_count(&self) -> u16 {
        self.slaves.len() as u16
    }
    /// slave holding the given station address
    pub fn slave(&mut self, address: u16) -> Option<&mut Slave> {
        self.slaves.iter_mut().find(|slave| slave.address == address)
    }

    /**
        bring the segment up to PRE-OP

        discovery, register reset, station addressing, EEPROM readout,
        mailbox sync-manager configuration and the PRE-OP transition, in that
        order. Any failing stage aborts the whole initialization.
    */
    pub fn init(&mut self) -> EthercatResult<(), AlError> {
        self.link
            .socket()
            .set_timeout(self.config.receive_timeout)?;

        self.detect_slaves().map_err(|e| e.upgrade())?;
        self.reset_slaves().map_err(|e| e.upgrade())?;
        self.assign_addresses().map_err(|e| e.upgrade())?;
        self.fetch_eeprom().map_err(|e| e.upgrade())?;
        self.configure_mailboxes().map_err(|e| e.upgrade())?;

        self.request_state(AlState::PreOperational)
            .map_err(|e| e.upgrade())?;
        self.wait_for_state(AlState::PreOperational)?;

        self.check_mailboxes().map_err(|e| e.upgrade())?;
        for slave in &self.slaves {
            debug!(
                "slave {:#06x}: state {:?} - in ready {} | out ready {}",
                slave.address,
                slave.al_state,
                slave.mailbox_config.can_read,
                slave.mailbox_config.can_write,
            );
        }
        info!("bus up, {} slaves in PRE-OP", self.slaves.len());
        Ok(())
    }

    /// count the slaves answering a broadcast and size the master structures accordingly
    fn detect_slaves(&mut self) -> EthercatResult {
        // the type register content does not matter, only the working counter does
        let answer: Answer<u8> = self.link.brd(registers::esc::ty)?;
        let count = answer.answers;
        if count == 0 {
            return Err(EthercatError::Master("no slave detected on the network"));
        }

        self.slaves = (0..count).map(|i| Slave::new(0x1000 + i)).collect();
        // two datagrams per slave in a row must fit without allocating (the mailbox availability poll)
        self.link.reserve(usize::from(count) * 2);

        info!("{} slaves detected on the network", count);
        Ok(())
    }

    /// wipe every register a previous master may have left configured
    fn reset_slaves(&mut self) -> EthercatResult {
        // ports back to auto mode
        self.link.bwr(registers::dl::port, 0u8)?;

        self.link.bwr(registers::rx_error, [0u8; 8])?;
        self.link.bwr(registers::fmmu::area, [0u8; 256])?;
        self.link.bwr(registers::sync_manager::area, [0u8; 128])?;
        self.link.bwr(registers::dc::system_time, [0u8; 8])?;
        self.link.bwr(registers::dc::sync_activation, 0u8)?;

        self.link.bwr(
            registers::dc::speed_counter_start,
            registers::DC_SPEED_COUNTER_START_RESET,
        )?;
        self.link
            .bwr(registers::dc::time_filter, registers::DC_TIME_FILTER_RESET)?;

        self.request_state(AlState::Init)?;

        // EEPROM interface to master control
        self.link.bwr(registers::sii::access, 0u16)?;
        Ok(())
    }

    /// assign a station address to every slave, by topological position, in one batch
    fn assign_addresses(&mut self) -> EthercatResult {
        for (position, slave) in self.slaves.iter().enumerate() {
            self.link.add_datagram(
                PduCommand::APRW,
                SlaveAddress::AutoIncremented(position as u16),
                registers::address::fixed.ado(),
                Some(&slave.address.to_le_bytes()),
                2,
            )?;
        }
        self.link.process_frames()?;
        for _ in 0..self.slaves.len() {
            let (_, _, wkc) = self.link.next_datagram()?;
            if wkc != 1 {
                return Err(EthercatError::WorkingCounter {
                    expected: 1,
                    received: wkc,
                });
            }
        }
        debug!(
            "station addresses {:#06x}..={:#06x} assigned",
            0x1000,
            0x1000 + self.slaves.len() - 1
        );
        Ok(())
    }

    /// read the identity and mailbox configuration words out of every slave EEPROM
    fn fetch_eeprom(&mut self) -> EthercatResult {
        use EepromWord::*;
        for word in [
            VendorId,
            ProductCode,
            RevisionNumber,
            SerialNumber,
            RecvMailbox,
            SendMailbox,
            MailboxProtocol,
            EepromSize,
        ] {
            self.read_eeprom(word)?;
        }

        for slave in &self.slaves {
            info!(
                "slave {:#06x}: vendor {:#010x} - product {:#010x} - revision {:#010x} - serial {:#010x}",
                slave.address,
                slave.vendor_id,
                slave.product_code,
                slave.revision_number,
                slave.serial_number,
            );
            debug!(
                "  mailbox out: offset {:#06x} size {} - mailbox in: offset {:#06x} size {}",
                slave.mailbox_config.recv_offset,
                slave.mailbox_config.recv_size,
                slave.mailbox_config.send_offset,
                slave.mailbox_config.send_size,
            );
            debug!(
                "  supported mailbox protocols: {:?} - eeprom {} bytes version {:#x}",
                slave.supported_mailbox, slave.eeprom_size, slave.eeprom_version,
            );
        }
        Ok(())
    }

    /// broadcast one EEPROM word read and store the result in every slave
    fn read_eeprom(&mut self, word: EepromWord) -> EthercatResult {
        let request = SiiRequest::new(sii::command::READ, word.address(), 0);
        let wkc = self.link.bwr(registers::sii::control_address, request)?;
        if usize::from(wkc) != self.slaves.len() {
            return Err(EthercatError::WorkingCounter {
                expected: self.slaves.len() as u16,
                received: wkc,
            });
        }

        if !self.eeprom_ready()? {
            return Err(EthercatError::Timeout("EEPROM readiness"));
        }

        let Self { link, slaves, .. } = self;
        for slave in slaves.iter() {
            link.add_datagram(
                PduCommand::FPRD,
                SlaveAddress::Fixed(slave.address),
                registers::sii::data.ado(),
                None,
                4,
            )?;
        }
        link.process_frames()?;
        for slave in slaves.iter_mut() {
            let answer: Answer<u32> = link.next_value()?;
            word.apply(slave, answer.one()?);
        }
        Ok(())
    }

    /// poll the SII interface until every slave cleared its busy bit
    fn eeprom_ready(&mut self) -> EthercatResult<bool> {
        let retries = self.config.eeprom_retries;
        let pause = self.config.eeprom_poll;
        for _ in 0..retries {
            thread::sleep(pause);

            let Self { link, slaves, .. } = self;
            for slave in slaves.iter() {
                link.add_datagram(
                    PduCommand::FPRD,
                    SlaveAddress::Fixed(slave.address),
                    registers::sii::control.ado(),
                    None,
                    2,
                )?;
            }
            link.process_frames()?;

            // a single straggler forces a whole new poll round
            let mut ready = true;
            for _ in 0..slaves.len() {
                let answer: Answer<SiiControl> = link.next_value()?;
                if answer.answers != 1 {
                    warn!("a slave did not answer the EEPROM status poll");
                    ready = false;
                    continue;
                }
                if answer.value.busy() {
                    ready = false;
                }
            }
            if ready {
                return Ok(true);
            }
            link.clear();
        }
        Ok(false)
    }

    /// write the mailbox sync-manager pair of every mailbox-capable slave, in one batch
    fn configure_mailboxes(&mut self) -> EthercatResult {
        let Self { link, slaves, .. } = self;
        let mut configured = 0;
        for slave in slaves.iter_mut() {
            if slave.supported_mailbox.none() {
                continue;
            }
            let config = slave.mailbox_config;
            // channel 0 receives from the master, channel 1 sends to it
            let channels = [
                SyncManagerChannel::new(
                    config.recv_offset,
                    config.recv_size,
                    sm::CONTROL_MAILBOX_WRITE,
                    0,
                    sm::ENABLE,
                    0,
                ),
                SyncManagerChannel::new(
                    config.send_offset,
                    config.send_size,
                    sm::CONTROL_MAILBOX_READ,
                    0,
                    sm::ENABLE,
                    0,
                ),
            ];
            let mut data = [0u8; 16];
            channels[0].pack(&mut data[..8])?;
            channels[1].pack(&mut data[8..])?;
            link.add_datagram(
                PduCommand::FPRW,
                SlaveAddress::Fixed(slave.address),
                registers::sync_manager::area.ado(),
                Some(&data),
                16,
            )?;
            slave.mailbox.set_capacity(usize::from(config.recv_size));
            configured += 1;
        }
        if configured == 0 {
            return Ok(());
        }

        link.process_frames()?;
        for _ in 0..configured {
            let (_, _, wkc) = link.next_datagram()?;
            if wkc != 1 {
                return Err(EthercatError::WorkingCounter {
                    expected: 1,
                    received: wkc,
                });
            }
        }
        Ok(())
    }

    /// broadcast an AL state change request, acknowledging any pending state error
    pub fn request_state(&mut self, state: AlState) -> EthercatResult {
        let control = AlControlRequest::new(u4::new(state as u8), true);
        let wkc = self.link.bwr(registers::al::control, control)?;
        if usize::from(wkc) != self.slaves.len() {
            return Err(EthercatError::WorkingCounter {
                expected: self.slaves.len() as u16,
                received: wkc,
            });
        }
        debug!("requested state {:?} for all slaves", state);
        Ok(())
    }

    /**
        read the current AL state of one slave

        when the slave flags a state-change error, the AL status code is
        fetched and reported as a typed error
    */
    pub fn get_current_state(&mut self, address: u16) -> EthercatResult<AlState, AlError> {
        let status = self
            .link
            .fprd(address, registers::al::status)
            .map_err(|e| e.upgrade())?
            .one()
            .map_err(|e| e.upgrade())?;
        if status.error() {
            let code = self
                .link
                .fprd(address, registers::al::error)
                .map_err(|e| e.upgrade())?
                .one()
                .map_err(|e| e.upgrade())?;
            return Err(EthercatError::Slave(
                SlaveAddress::Fixed(address),
                AlError::from(code),
            ));
        }
        AlState::try_from(status.state().value())
            .map_err(|_| EthercatError::Protocol("invalid AL state reported"))
    }

    /// poll every slave until it reaches the requested state, within the configured timeout
    pub fn wait_for_state(&mut self, target: AlState) -> EthercatResult<(), AlError> {
        let deadline = Instant::now() + self.config.state_timeout;
        loop {
            let mut reached = true;
            for index in 0..self.slaves.len() {
                let address = self.slaves[index].address;
                let state = self.get_current_state(address)?;
                self.slaves[index].al_state = state;
                if state != target {
                    reached = false;
                }
            }
            if reached {
                debug!("all slaves reached {:?}", target);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(EthercatError::Timeout("AL state change"));
            }
            thread::sleep(self.config.state_poll);
        }
    }

    /**
        poll the mailbox sync-manager statuses of every slave

        decoding relies on the issue order: for each slave the first datagram
        is SM0 (master to slave), the second SM1 (slave to master). A full
        SM0 means the slave did not consume the previous message yet, a full
        SM1 means a message is available for reading.
    */
    pub fn check_mailboxes(&mut self) -> EthercatResult {
        let Self { link, slaves, .. } = self;
        if slaves.is_empty() {
            return Ok(());
        }
        let interface = &registers::sync_manager::interface;
        for slave in slaves.iter() {
            link.add_datagram(
                PduCommand::FPRD,
                SlaveAddress::Fixed(slave.address),
                interface.status(0).ado(),
                None,
                1,
            )?;
            link.add_datagram(
                PduCommand::FPRD,
                SlaveAddress::Fixed(slave.address),
                interface.status(1).ado(),
                None,
                1,
            )?;
        }
        link.process_frames()?;

        for slave in slaves.iter_mut() {
            let sm0: Answer<u8> = link.next_value()?;
            let sm1: Answer<u8> = link.next_value()?;
            if sm0.answers != 1 || sm1.answers != 1 {
                warn!(
                    "slave {:#06x} did not answer the mailbox availability poll",
                    slave.address
                );
                slave.mailbox_config.can_write = false;
                slave.mailbox_config.can_read = false;
                continue;
            }
            slave.mailbox_config.can_write = sm0.value & sm::STATUS_MAILBOX_FULL == 0;
            slave.mailbox_config.can_read = sm1.value & sm::STATUS_MAILBOX_FULL != 0;
        }
        Ok(())
    }

    /**
        run one mailbox cycle for the whole segment

        polls the mailbox availability, writes one pending message to every
        slave that can accept one, then reads and dispatches every available
        incoming message. Working counter failures on individual transfers
        are logged and isolated to their slave.
    */
    pub fn process_mailboxes(&mut self) -> EthercatResult {
        self.check_mailboxes()?;

        // write phase
        {
            let Self { link, slaves, .. } = self;
            let mut writes = 0;
            for slave in slaves.iter_mut() {
                if !slave.mailbox_config.can_write || !slave.mailbox.pending() {
                    continue;
                }
                let address = slave.address;
                let config = slave.mailbox_config;
                let Some(message) = slave.mailbox.send() else {
                    continue;
                };
                link.add_datagram(
                    PduCommand::FPWR,
                    SlaveAddress::Fixed(address),
                    config.recv_offset,
                    Some(message.request()),
                    config.recv_size,
                )?;
                writes += 1;
            }
            if writes > 0 {
                link.process_frames()?;
                for _ in 0..writes {
                    let (_, _, wkc) = link.next_datagram()?;
                    if wkc != 1 {
                        warn!("a mailbox write was not acknowledged");
                    }
                }
            }
        }

        // read phase
        {
            let Self { link, slaves, .. } = self;
            let mut readers = Vec::new();
            for (index, slave) in slaves.iter().enumerate() {
                if !slave.mailbox_config.can_read {
                    continue;
                }
                link.add_datagram(
                    PduCommand::FPRD,
                    SlaveAddress::Fixed(slave.address),
                    slave.mailbox_config.send_offset,
                    None,
                    slave.mailbox_config.send_size,
                )?;
                readers.push(index);
            }
            if !readers.is_empty() {
                link.process_frames()?;
                for index in readers {
                    let (_, payload, wkc) = link.next_datagram()?;
                    if wkc != 1 {
                        warn!(
                            "slave {:#06x} did not answer the mailbox read",
                            slaves[index].address
                        );
                        continue;
                    }
                    if !slaves[index].mailbox.receive(payload) {
                        debug!(
                            "slave {:#06x} sent a mailbox frame nobody waited for",
                            slaves[index].address
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /**
        upload an SDO from a slave, blocking until completion

        `capacity` bounds the accepted data size. Returns the uploaded bytes,
        or the terminal status of the message as a slave error.
    */
    pub fn sdo_upload(
        &mut self,
        address: u16,
        sdo: Sdo,
        capacity: usize,
    ) -> EthercatResult<Vec<u8>, MessageStatus> {
        let index = self
            .index_of(address)
            .ok_or(EthercatError::Master("no slave with this address"))?;
        let token = self.slaves[index].mailbox.sdo_upload(sdo, capacity);
        self.drive_mailbox(index, token)?;
        Ok(self.slaves[index]
            .mailbox
            .take_data(token)
            .unwrap_or_default())
    }

    /// download an SDO to a slave, blocking until the slave acknowledged the whole transfer
    pub fn sdo_download(
        &mut self,
        address: u16,
        sdo: Sdo,
        data: &[u8],
    ) -> EthercatResult<(), MessageStatus> {
        let index = self
            .index_of(address)
            .ok_or(EthercatError::Master("no slave with this address"))?;
        let token = self.slaves[index].mailbox.sdo_download(sdo, data);
        self.drive_mailbox(index, token)?;
        self.slaves[index].mailbox.take_data(token);
        Ok(())
    }

    fn index_of(&self, address: u16) -> Option<usize> {
        self.slaves.iter().position(|slave| slave.address == address)
    }

    /// cycle the mailboxes until the given message reaches a terminal status
    fn drive_mailbox(&mut self, index: usize, token: Token) -> EthercatResult<(), MessageStatus> {
        for _ in 0..self.config.mailbox_cycles {
            self.process_mailboxes().map_err(|e| e.upgrade())?;
            match self.slaves[index].mailbox.status(token) {
                Some(MessageStatus::Running) => continue,
                Some(MessageStatus::Success) => return Ok(()),
                Some(status) => {
                    return Err(EthercatError::Slave(
                        SlaveAddress::Fixed(self.slaves[index].address),
                        status,
                    ))
                }
                None => return Err(EthercatError::Master("mailbox message vanished")),
            }
        }
        Err(EthercatError::Timeout("mailbox exchange"))
    }
}
