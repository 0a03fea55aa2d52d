//! structs and consts for the registers in a standard slave's physical memory. This should be used instead of any hardcoded register value

use crate::data::{bilge_pdudata, bilge_pdudata_wide, Field};
use bilge::prelude::*;

/// communication state of a slave, ETG.1000.6 table 9
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum AlState {
    Init = 1,
    PreOperational = 2,
    Bootstrap = 3,
    SafeOperational = 4,
    Operational = 8,
}

impl TryFrom<u8> for AlState {
    type Error = crate::data::PackingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Init),
            2 => Ok(Self::PreOperational),
            3 => Ok(Self::Bootstrap),
            4 => Ok(Self::SafeOperational),
            8 => Ok(Self::Operational),
            _ => Err(crate::data::PackingError::InvalidValue("no such AL state")),
        }
    }
}

/**
    register requesting a state change when written by the master

    the error acknowledge bit must be set to clear a pending state-change
    error on the slave, so state requests conventionally set it.
*/
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct AlControlRequest {
    /// requested state, one of [AlState]
    pub state: u4,
    /// acknowledge a previous state-change error
    pub ack: bool,
    reserved: u11,
}
bilge_pdudata!(AlControlRequest, u16);

/// register reporting the current state of a slave
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct AlStatusRegister {
    /// current state, one of [AlState]
    pub state: u4,
    /// a state change failed, the cause is in the AL status code register
    pub error: bool,
    reserved: u11,
}
bilge_pdudata!(AlStatusRegister, u16);

/// state-change error reported by a slave in its AL status code register
///
/// ETG.1000.6 table 11, restricted to the codes a mailbox-level master can encounter
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AlError {
    NoError,
    Unspecified,
    NoMemory,
    InvalidStateRequest,
    UnknownStateRequest,
    BootstrapNotSupported,
    NoValidFirmware,
    InvalidMailboxConfig,
    InvalidSyncConfig,
    Synchronization,
    SyncWatchdog,
    NeedColdStart,
    NeedInit,
    NeedPreop,
    NeedSafeop,
    EepromNoAccess,
    EepromError,
    SlaveRestarted,
    /// any other code, vendor specific or not decoded here
    Other(u16),
}

impl From<u16> for AlError {
    fn from(code: u16) -> Self {
        match code {
            0x0000 => Self::NoError,
            0x0001 => Self::Unspecified,
            0x0002 => Self::NoMemory,
            0x0011 => Self::InvalidStateRequest,
            0x0012 => Self::UnknownStateRequest,
            0x0013 => Self::BootstrapNotSupported,
            0x0014 => Self::NoValidFirmware,
            0x0015 | 0x0016 => Self::InvalidMailboxConfig,
            0x0017 => Self::InvalidSyncConfig,
            0x001A => Self::Synchronization,
            0x001B => Self::SyncWatchdog,
            0x0020 => Self::NeedColdStart,
            0x0021 => Self::NeedInit,
            0x0022 => Self::NeedPreop,
            0x0023 => Self::NeedSafeop,
            0x0050 => Self::EepromNoAccess,
            0x0051 => Self::EepromError,
            0x0060 => Self::SlaveRestarted,
            other => Self::Other(other),
        }
    }
}

/// used by the slave to inform the master which mailbox protocols can be used with it
/// ETG.1000.6 table 18
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct MailboxSupport {
    /// ADS over EtherCAT (routing and parallel services)
    pub aoe: bool,
    /// Ethernet over EtherCAT (tunnelling of Data Link services)
    pub eoe: bool,
    /// CAN application protocol over EtherCAT (access to SDO)
    pub coe: bool,
    /// File Access over EtherCAT
    pub foe: bool,
    /// Servo Drive Profile over EtherCAT
    pub soe: bool,
    /// Vendor specific protocol over EtherCAT
    pub voe: bool,
    reserved: u10,
}
bilge_pdudata!(MailboxSupport, u16);

impl MailboxSupport {
    /// true if the slave supports no mailbox protocol at all
    pub fn none(&self) -> bool {
        u16::from(*self) == 0
    }
}

/**
    one sync manager channel, controlling the access to a consistent area of the slave's memory

    the master configures mailbox exchanges by writing channel 0 (master to
    slave) and channel 1 (slave to master) of the sync manager register area.

    ETG.1000.4 table 59
*/
#[bitsize(64)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct SyncManagerChannel {
    /// start address of the managed area in the slave physical memory
    pub address: u16,
    /// byte length of the managed area
    pub length: u16,
    /// buffer mode, access direction and IRQ settings
    pub control: u8,
    /// read-only for the master
    pub status: u8,
    /// channel enable
    pub activate: u8,
    /// read-only for the master
    pub pdi_control: u8,
}
bilge_pdudata!(SyncManagerChannel, u64);

/// values and masks for [SyncManagerChannel] fields
pub mod sm {
    /// one-buffered, write access, PDI IRQ enabled: a mailbox the master writes to
    pub const CONTROL_MAILBOX_WRITE: u8 = 0x26;
    /// one-buffered, read access, PDI IRQ enabled: a mailbox the master reads from
    pub const CONTROL_MAILBOX_READ: u8 = 0x22;
    /// channel enable value for the activate register
    pub const ENABLE: u8 = 0x01;
    /// "buffer full" flag in the status register
    pub const STATUS_MAILBOX_FULL: u8 = 0x08;
}

/// this is not a register content but a convenience struct transporting the addresses of the sync manager channels
pub struct SyncManager {
    /// address of the first channel
    pub address: u16,
    /// number of channels
    pub num: u8,
}

impl SyncManager {
    /// byte length of one channel
    pub const CHANNEL_SIZE: u16 = 8;
    /// offset of the status byte in a channel
    pub const STATUS_OFFSET: u16 = 0x05;

    /// register of the complete given channel
    pub const fn channel(&self, index: u8) -> Field<SyncManagerChannel> {
        assert!(index < self.num, "index out of range");
        Field::simple((self.address + index as u16 * Self::CHANNEL_SIZE) as usize)
    }
    /// register of the status byte of the given channel
    pub const fn status(&self, index: u8) -> Field<u8> {
        assert!(index < self.num, "index out of range");
        Field::simple(
            (self.address + index as u16 * Self::CHANNEL_SIZE + Self::STATUS_OFFSET) as usize,
        )
    }
    /// channel reserved for master-to-slave mailbox transfers
    pub const fn mailbox_write(&self) -> Field<SyncManagerChannel> {
        self.channel(0)
    }
    /// channel reserved for slave-to-master mailbox transfers
    pub const fn mailbox_read(&self) -> Field<SyncManagerChannel> {
        self.channel(1)
    }
}

/**
    register controlling the read/write operations of the Slave Information Interface (SII), the access port to the slave's EEPROM

    ETG.1000.4 table 49
*/
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct SiiControl {
    /// true if the EEPROM is writable through the SII
    pub write_access: bool,
    reserved: u4,
    /// true when the DL-user emulates the SII instead of a physical EEPROM
    pub eeprom_emulation: bool,
    /// false: 4 bytes per read transaction, true: 8 bytes
    pub read_size: bool,
    /// false: SII addresses in bytes, true: in words
    pub address_unit: bool,
    /// read operation requested (write) or in progress (read)
    pub read_operation: bool,
    /// write operation requested (write) or in progress (read)
    pub write_operation: bool,
    /// reload operation requested (write) or in progress (read)
    pub reload_operation: bool,
    /// checksum error while reading at startup
    pub checksum_error: bool,
    /// error on reading device information
    pub device_info_error: bool,
    /// error on last command
    pub command_error: bool,
    /// error on last write operation
    pub write_error: bool,
    /// an operation is ongoing
    pub busy: bool,
}
bilge_pdudata!(SiiControl, u16);

/// content of an EEPROM operation request: the SII control word followed by the word address to access
#[bitsize(48)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct SiiRequest {
    /// command word, one of [sii_command](crate::sii::command)
    pub command: u16,
    /// low word of the EEPROM address
    pub address_low: u16,
    /// high word of the EEPROM address, zero for the standard 16-bit address space
    pub address_high: u16,
}
bilge_pdudata_wide!(SiiRequest, u48, u64, 6);

/// base identification register of the slave controller
pub mod esc {
    use super::*;

    /// type of the slave controller, only read during discovery for its working counter
    pub const ty: Field<u8> = Field::simple(0x0000);
}

pub mod address {
    use super::*;

    /// register of the station address, aka the fixed slave address
    /// ETG.1000.4 table 32
    pub const fixed: Field<u16> = Field::simple(0x0010);
    /// slave address alias
    /// ETG.1000.4 table 32
    pub const alias: Field<u16> = Field::simple(0x0012);
}

pub mod dl {
    use super::*;

    /// port mode register, zeroed at reset to put every port back to auto mode
    pub const port: Field<u8> = Field::simple(0x0101);
}

/// RX error counters of the 4 ports, a write to any of them resets the group
pub const rx_error: Field<[u8; 8]> = Field::simple(0x0300);

pub mod al {
    use super::*;

    /// state change request register
    pub const control: Field<AlControlRequest> = Field::simple(0x0120);
    /// current state report register
    pub const status: Field<AlStatusRegister> = Field::simple(0x0130);
    /// cause of the last state change error
    pub const error: Field<u16> = Field::simple(0x0134);
}

pub mod sii {
    use super::*;

    /// EEPROM access configuration, zeroed to give the EEPROM to the master
    pub const access: Field<u16> = Field::simple(0x0500);
    /// SII control/status word
    pub const control: Field<SiiControl> = Field::simple(0x0502);
    /// SII control word and address, written together to start an operation
    pub const control_address: Field<SiiRequest> = Field::simple(0x0502);
    /// data of the last SII read operation
    pub const data: Field<u32> = Field::simple(0x0508);
}

pub mod fmmu {
    use super::*;

    /// the whole FMMU entries area, zeroed at reset
    pub const area: Field<[u8; 256]> = Field::simple(0x0600);
}

pub mod sync_manager {
    use super::*;

    /// the whole sync manager channels area, zeroed at reset
    pub const area: Field<[u8; 128]> = Field::simple(0x0800);
    /// the sync manager channels
    pub const interface: SyncManager = SyncManager {
        address: 0x0800,
        num: 16,
    };
}

pub mod dc {
    use super::*;

    /// DC system time, zeroed at reset
    pub const system_time: Field<[u8; 8]> = Field::simple(0x0910);
    /// speed counter start, documented reset value 0x1000
    pub const speed_counter_start: Field<u16> = Field::simple(0x0930);
    /// system time filter depth, documented reset value 0x0C00
    pub const time_filter: Field<u16> = Field::simple(0x0934);
    /// cyclic unit and sync signal activation, zeroed at reset
    pub const sync_activation: Field<u8> = Field::simple(0x0980);
}

/// documented reset value for [dc::speed_counter_start]
pub const DC_SPEED_COUNTER_START_RESET: u16 = 0x1000;
/// documented reset value for [dc::time_filter]
pub const DC_TIME_FILTER_RESET: u16 = 0x0C00;
