//! per-slave data model, filled by the bus controller during bring-up

use crate::mailbox::Mailbox;
use crate::registers::{AlState, MailboxSupport};

/// sync-manager backed mailbox area on a slave, as declared in its EEPROM
#[derive(Copy, Clone, Debug, Default)]
pub struct MailboxConfig {
    /// physical address of the master-to-slave buffer
    pub recv_offset: u16,
    /// byte length of the master-to-slave buffer
    pub recv_size: u16,
    /// physical address of the slave-to-master buffer
    pub send_offset: u16,
    /// byte length of the slave-to-master buffer
    pub send_size: u16,

    /// a slave-to-master message is available
    pub can_read: bool,
    /// the slave can accept a new master-to-slave message
    pub can_write: bool,
}

/**
    one slave device on the segment

    Created at discovery, identified by the station address the master
    assigned to it, and mutated by the bus controller during bring-up as the
    EEPROM content is read out.
*/
pub struct Slave {
    /// station address assigned by the master
    pub address: u16,

    pub vendor_id: u32,
    pub product_code: u32,
    pub revision_number: u32,
    pub serial_number: u32,

    /// standard mailbox configuration
    pub mailbox_config: MailboxConfig,
    /// mailbox configuration to use in bootstrap state, usually bigger for firmware transfers
    pub mailbox_bootstrap: MailboxConfig,
    /// mailbox protocols the slave declares to support
    pub supported_mailbox: MailboxSupport,

    /// EEPROM size in bytes
    pub eeprom_size: u32,
    pub eeprom_version: u16,

    /// last state observed by the bus controller
    pub al_state: AlState,

    /// mailbox transport engine of this slave
    pub mailbox: Mailbox,
}

impl Slave {
    pub fn new(address: u16) -> Self {
        Self {
            address,
            vendor_id: 0,
            product_code: 0,
            revision_number: 0,
            serial_number: 0,
            mailbox_config: MailboxConfig::default(),
            mailbox_bootstrap: MailboxConfig::default(),
            supported_mailbox: MailboxSupport::default(),
            eeprom_size: 0,
            eeprom_version: 0,
            al_state: AlState::Init,
            mailbox: Mailbox::new(),
        }
    }
}
