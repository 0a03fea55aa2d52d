use super::{EthercatSocket, PRIMARY_IF_MAC};
use packed_struct::prelude::*;
use packed_struct::types::bits::ByteArray;
use std::io::{self, Cursor, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

/**
    Raw socket allowing direct ethercat com, but only one segment on the ethernet network

    Raw sockets are not implemented in [std::net], so here is an implementation
    based on `libc`. This implementation is unix-specific.
*/
#[derive(Debug)]
pub struct EthernetSocket {
    protocol: libc::c_ushort,
    lower: libc::c_int,
    header: EthernetHeader,
    filter_address: bool,
}

/// biggest ethernet frame to expect: header + ethercat header + maximal datagram section
const MAX_ETHERNET_FRAME: usize = 1518;
/// minimal ethernet frame length, shorter frames are padded up to it
const MIN_ETHERNET_FRAME: usize = 60;
/// ethernet protocol (ethertype) reserved for ethercat
const ETHERCAT_ETHERTYPE: u16 = 0x88A4;

impl EthernetSocket {
    pub fn new(interface: &str) -> io::Result<Self> {
        // create
        let lower = unsafe {
            let lower = libc::socket(
                // Ethernet II frames
                libc::AF_PACKET,
                libc::SOCK_RAW,
                ETHERCAT_ETHERTYPE.to_be() as i32,
            );
            if lower == -1 {
                return Err(io::Error::last_os_error());
            }
            lower
        };

        let new = EthernetSocket {
            protocol: ETHERCAT_ETHERTYPE,
            lower,
            header: EthernetHeader {
                // the segment circulates the frame on topological position, not on MAC
                dst: [0xff; 6],
                src: PRIMARY_IF_MAC,
                protocol: ETHERCAT_ETHERTYPE,
            },
            filter_address: true,
        };

        // bind
        let mut ifreq = ifreq_for(interface);
        let sockaddr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: new.protocol.to_be() as u16,
            sll_ifindex: ifreq_ioctl(new.lower, &mut ifreq, libc::SIOCGIFINDEX)?,
            sll_hatype: 1,
            sll_pkttype: 0,
            sll_halen: 6,
            sll_addr: [0; 8],
        };

        unsafe {
            #[allow(trivial_casts)]
            let res = libc::bind(
                new.lower,
                &sockaddr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            );
            if res == -1 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(new)
    }

    /// if enabled, the incoming packets with a wrong src&dst header will be ignored
    pub fn set_filter_address(&mut self, enable: bool) {
        self.filter_address = enable;
    }
}

impl Drop for EthernetSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.lower);
        }
    }
}

impl AsRawFd for EthernetSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.lower
    }
}

impl EthercatSocket for EthernetSocket {
    fn receive(&self, data: &mut [u8]) -> io::Result<usize> {
        // the maximum ethernet frame used in ethercat is reasonably small so we can allocate the maximum on the stack
        let mut packed = [0u8; MAX_ETHERNET_FRAME];
        loop {
            let len = unsafe {
                libc::read(
                    self.as_raw_fd(),
                    packed.as_mut_ptr() as *mut libc::c_void,
                    packed.len(),
                )
            };
            if len < 0 {
                break Err(io::Error::last_os_error());
            }
            if len == 0 {
                continue;
            }

            let frame = EthernetFrame::unpack(&packed[..len as usize])?;
            if self.filter_address && frame.header != self.header {
                continue;
            }
            data[..frame.data.len()].copy_from_slice(frame.data);

            break Ok(frame.data.len());
        }
    }

    fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut packed = [0u8; MAX_ETHERNET_FRAME];
        let packet = EthernetFrame {
            header: self.header.clone(),
            data,
        };
        packet.pack(&mut packed);
        let data = &packed[..packet.size()];

        let len = unsafe {
            libc::write(
                self.as_raw_fd(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
            )
        };
        if len < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn set_timeout(&self, timeout: Duration) -> io::Result<()> {
        let time = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        unsafe {
            #[allow(trivial_casts)]
            let res = libc::setsockopt(
                self.lower,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &time as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            );
            if res == -1 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

// intermediate C-like structures and functions

fn ifreq_ioctl(
    lower: libc::c_int,
    ifreq: &mut libc::ifreq,
    cmd: libc::c_ulong,
) -> io::Result<libc::c_int> {
    unsafe {
        #[allow(trivial_casts)]
        let res = libc::ioctl(lower, cmd as _, ifreq as *mut libc::ifreq);
        if res == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(ifreq.ifr_ifru.ifru_ifindex)
    }
}

fn ifreq_for(name: &str) -> libc::ifreq {
    let mut ifreq: libc::ifreq = unsafe { std::mem::zeroed() };
    for (i, byte) in name.as_bytes().iter().take(libc::IF_NAMESIZE - 1).enumerate() {
        ifreq.ifr_name[i] = *byte as libc::c_char;
    }
    ifreq
}

/// an ethernet frame in its unpacked form
/// its data is of variable size, so it is not owned here but references some user buffer
#[derive(Debug)]
struct EthernetFrame<'a> {
    header: EthernetHeader,
    data: &'a [u8],
}

impl<'a> EthernetFrame<'a> {
    fn size(&self) -> usize {
        (<EthernetHeader as PackedStruct>::ByteArray::len() + self.data.len())
            .max(MIN_ETHERNET_FRAME)
    }
    fn pack(&self, dst: &mut [u8]) {
        let mut dst = Cursor::new(dst);
        let padding = [0; MIN_ETHERNET_FRAME];
        dst.write_all(self.header.pack().unwrap().as_bytes_slice())
            .unwrap();
        dst.write_all(self.data).unwrap();
        let pos = dst.position() as usize;
        if pos < padding.len() {
            dst.write_all(&padding[pos..]).unwrap();
        }
    }
    fn unpack(src: &'a [u8]) -> io::Result<Self> {
        let header_size = <EthernetHeader as PackedStruct>::ByteArray::len();
        if src.len() < header_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "truncated ethernet frame",
            ));
        }
        let header = EthernetHeader::unpack_from_slice(&src[..header_size])
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad ethernet header"))?;
        Ok(Self {
            header,
            data: &src[header_size..],
        })
    }
}

/// ethernet frame header as specified in ISO/IEC 8802-3
#[derive(PackedStruct, Clone, Debug, Eq, PartialEq)]
#[packed_struct(size_bytes = "14", bit_numbering = "lsb0", endian = "msb")]
struct EthernetHeader {
    /// destination MAC address
    #[packed_field(bytes = "8:13")]
    dst: [u8; 6],
    /// source MAC address
    #[packed_field(bytes = "2:7")]
    src: [u8; 6],
    /// ethernet protocol
    #[packed_field(bytes = "0:1")]
    protocol: u16,
}
