/*!
    SII (Slave Information Interface) word map: where to find the declarative
    informations of a slave (identity, mailbox config, EEPROM geometry) in its
    EEPROM.

    Addresses here are in the word unit used by the EEPROM request register,
    to be written as-is in a [SiiRequest](crate::registers::SiiRequest).

    ETG.1000.6 table 16
*/

/// commands accepted by the SII control word
pub mod command {
    /// start a read operation at the requested address
    pub const READ: u16 = 0x0100;
    /// start a write operation at the requested address
    pub const WRITE: u16 = 0x0201;
    /// reload the slave configuration from the EEPROM
    pub const RELOAD: u16 = 0x0300;
}

/// unique id of the vendor (normalized by ETG)
pub const VENDOR_ID: u16 = 0x08;
/// unique id of the product (normalized by the vendor)
pub const PRODUCT_CODE: u16 = 0x0A;
/// id of the product revision (normalized by the vendor)
pub const REVISION_NUMBER: u16 = 0x0C;
/// serial number of the device (normalized by the vendor)
pub const SERIAL_NUMBER: u16 = 0x0E;

/// start of the standard mailbox configuration area
pub const STANDARD_MAILBOX: u16 = 0x18;
/// offset of the receive (master to slave) mailbox offset/size pair
pub const RECV_MAILBOX_OFFSET: u16 = 0;
/// offset of the send (slave to master) mailbox offset/size pair
pub const SEND_MAILBOX_OFFSET: u16 = 2;

/// bit set of the mailbox protocols supported by the slave
pub const MAILBOX_PROTOCOL: u16 = 0x1C;

/// EEPROM geometry: low byte is the size in kibibit minus one, high word is the version
pub const EEPROM_SIZE: u16 = 0x3E;

/// decode the byte size of the EEPROM from the [EEPROM_SIZE] word (0 means 1 Kibit)
pub fn eeprom_size_bytes(word: u32) -> u32 {
    ((word & 0xFF) + 1) * 128
}

/// decode the EEPROM version from the [EEPROM_SIZE] word
pub fn eeprom_version(word: u32) -> u16 {
    (word >> 16) as u16
}
