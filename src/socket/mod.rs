mod ethernet;

pub use ethernet::EthernetSocket;

use std::io;
use std::time::Duration;

/// source MAC address marking the frames that originated from this master,
/// so they can be told apart from their circulated counterparts on
/// loopback or forwarding interface configurations
pub const PRIMARY_IF_MAC: [u8; 6] = [0x02, 0x10, 0x10, 0x10, 0x10, 0x10];

/**
    trait implementing the ethercat frame encapsulation into some medium

    This allows to send and receive ethercat frames over any network.
    According to ETG.1000.4 only raw ethernet and UDP are officially
    supported, this crate ships the raw ethernet one.

    Implementations are blocking: the master suspends in [receive](Self::receive)
    until the circulated frame comes back or the configured timeout elapses.
*/
pub trait EthercatSocket {
    /// send one ethercat frame, the medium encapsulation is added by this function
    fn send(&self, data: &[u8]) -> io::Result<()>;
    /// receive one ethercat frame into the given buffer, stripped of its medium encapsulation
    fn receive(&self, data: &mut [u8]) -> io::Result<usize>;
    /// bound the time [receive](Self::receive) may block waiting for a frame
    fn set_timeout(&self, timeout: Duration) -> io::Result<()>;
}
