/*!
    Etherbus is a crate implementing the core of an EtherCAT master: it
    discovers the slaves chained on the segment, brings them through the
    EtherCAT state machine, reads their configuration out of their EEPROM,
    and runs a reliable request/response mailbox transport for acyclic
    parameter access (CoE SDO upload/download, including segmented
    transfers, and emergency messages).

    The master owns the link: one thread drives the bus cycle, all
    suspensions happen at the socket boundary or at bounded polling sleeps.
    Many datagrams are coalesced into as few ethernet frames as possible and
    their replies are demultiplexed back to the issuers in issue order.

    ## Main entry points

    - [Bus] for bring-up and bus-cycle driving
    - [Slave] for the per-device data collected during bring-up
    - [Mailbox](mailbox::Mailbox) for the per-slave message queues
    - [EthernetSocket] for raw-ethernet segments, or any [EthercatSocket] impl

    ## Feature list

    - [x] slave discovery and station addressing
    - [x] register reset and INIT/PRE-OP transitions, with AL status code reporting
    - [x] EEPROM readout (identity, mailbox configuration, geometry)
    - [x] mailbox over sync-manager pairs
        + [x] CoE SDO expedited and segmented transfers
        + [x] asynchronous emergency ingestion
    - [ ] process data and FMMU mapping for the OP state
    - [ ] distributed clocks
*/

pub mod bus;
pub mod can;
pub mod data;
mod error;
pub mod frame;
pub mod link;
pub mod mailbox;
#[allow(non_upper_case_globals)]
pub mod registers;
pub mod sdo;
#[allow(non_upper_case_globals)]
pub mod sii;
pub mod slave;
pub mod socket;

pub use crate::bus::{Bus, BusConfig};
pub use crate::data::{Field, PduData};
pub use crate::error::{EthercatError, EthercatResult};
pub use crate::frame::{PduCommand, SlaveAddress};
pub use crate::link::Link;
pub use crate::registers::AlState;
pub use crate::sdo::Sdo;
pub use crate::slave::Slave;
pub use crate::socket::{EthercatSocket, EthernetSocket, PRIMARY_IF_MAC};
