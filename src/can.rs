/*!
    CoE (CANopen over EtherCAT) wire structures and SDO service encoding.

    It works exactly as on a CAN bus, except each frame is encapsulated in a
    mailbox frame and the mailbox capacity allows segments much larger than
    the 8 bytes of a CAN frame. The segment length is therefore derived from
    the mailbox header length, the 3-bit size field only being meaningful for
    CAN-sized segments.
*/

use crate::data::{bilge_pdudata, PduData};
use crate::sdo::Sdo;
use bilge::prelude::*;

/// byte length of [CoeHeader]
pub const COE_HEADER_SIZE: usize = 2;
/// byte length of [SdoHeader]
pub const SDO_HEADER_SIZE: usize = 4;
/// byte length of [SdoSegmentHeader]
pub const SDO_SEGMENT_HEADER_SIZE: usize = 1;
/// maximum byte size of sdo data that can be expedited
pub const EXPEDITED_MAX_SIZE: usize = 4;
/// byte length of the service data of an SDO request or expedited/initiate response
pub const SDO_REQUEST_SIZE: usize = COE_HEADER_SIZE + SDO_HEADER_SIZE + EXPEDITED_MAX_SIZE;
/// byte length of an emergency service data
pub const EMERGENCY_SIZE: usize = COE_HEADER_SIZE + 8;

/// header prefixing every CoE service data
/// ETG.1000.6 table 31
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct CoeHeader {
    /// present in the Can protocol, but not used in CoE
    pub number: u9,
    reserved: u3,
    /// Can service, one of [CanService]
    pub service: u4,
}
bilge_pdudata!(CoeHeader, u16);

impl CoeHeader {
    pub fn of(service: CanService) -> Self {
        Self::new(u9::new(0), u4::new(service as u8))
    }
    pub fn is(&self, service: CanService) -> bool {
        self.service().value() == service as u8
    }
}

/**
    Type of can service

    receiving and transmitting is from the point of view of the slave:
        - transmitting is slave to master
        - receiving is master to slave
*/
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum CanService {
    Emergency = 0x1,
    SdoRequest = 0x2,
    SdoResponse = 0x3,
    TransmitPdo = 0x4,
    ReceivePdo = 0x5,
    TransmitPdoRemoteRequest = 0x6,
    ReceivePdoRemoteRequest = 0x7,
    SdoInformation = 0x8,
}

impl TryFrom<u8> for CanService {
    type Error = crate::data::PackingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x1 => Self::Emergency,
            0x2 => Self::SdoRequest,
            0x3 => Self::SdoResponse,
            0x4 => Self::TransmitPdo,
            0x5 => Self::ReceivePdo,
            0x6 => Self::TransmitPdoRemoteRequest,
            0x7 => Self::ReceivePdoRemoteRequest,
            0x8 => Self::SdoInformation,
            _ => return Err(crate::data::PackingError::InvalidValue("no such can service")),
        })
    }
}

/// header for operations with SDOs
/// ETG.1000.6 5.6.2
#[bitsize(32)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct SdoHeader {
    /// true if a data size is specified
    pub sized: bool,
    /// true in case of an expedited transfer (data in the 4 bytes following this header)
    pub expedited: bool,
    /// for an expedited transfer, number of bytes of the 4-byte data area NOT containing data
    pub size: u2,
    /// true if a complete SDO is accessed
    pub complete: bool,
    /// command specifier, one of [command]
    pub command: u3,
    /// SDO index
    pub index: u16,
    /// SDO subindex, or 0/1 for a complete access
    pub sub: u8,
}
bilge_pdudata!(SdoHeader, u32);

/// header for segments of a segmented SDO transfer
/// ETG.1000.6 5.6.2
#[bitsize(8)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq)]
pub struct SdoSegmentHeader {
    /// another segment follows this one
    pub more: bool,
    /// for CAN-sized segments, number of bytes of the 7-byte data area NOT containing data
    pub size: u3,
    /// alternates between consecutive segments, starting at false
    pub toggle: bool,
    /// command specifier, one of [command]
    pub command: u3,
}
bilge_pdudata!(SdoSegmentHeader, u8);

/// SDO command specifiers, request and response values overlap
/// ETG.1000.6 5.6.2.1-7
pub mod command {
    pub const DOWNLOAD_SEGMENT_REQUEST: u8 = 0x0;
    pub const DOWNLOAD_REQUEST: u8 = 0x1;
    pub const UPLOAD_REQUEST: u8 = 0x2;
    pub const UPLOAD_SEGMENT_REQUEST: u8 = 0x3;

    pub const UPLOAD_SEGMENT_RESPONSE: u8 = 0x0;
    pub const DOWNLOAD_SEGMENT_RESPONSE: u8 = 0x1;
    pub const UPLOAD_RESPONSE: u8 = 0x2;
    pub const DOWNLOAD_RESPONSE: u8 = 0x3;

    pub const ABORT: u8 = 0x4;
}

/// emergency message asynchronously transmitted by a slave
/// ETG.1000.6 table 43
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Emergency {
    pub error_code: u16,
    pub error_register: u8,
    pub data: [u8; 5],
}

impl Emergency {
    /// decode an emergency from the service data following a [CoeHeader]
    pub fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
        Ok(Self {
            error_code: u16::unpack(src)?,
            error_register: u8::unpack(&src[2..])?,
            data: <[u8; 5]>::unpack(&src[3..])?,
        })
    }
}

// encoding of the SDO services issued by the master, each returns the
// service data length written at the start of `dst`

/// expedited or normal upload request
pub fn upload_request(dst: &mut [u8], sdo: Sdo) -> usize {
    CoeHeader::of(CanService::SdoRequest).pack(dst).unwrap();
    SdoHeader::new(
        false,
        false,
        u2::new(0),
        sdo.complete,
        u3::new(command::UPLOAD_REQUEST),
        sdo.index,
        sdo.sub,
    )
    .pack(&mut dst[COE_HEADER_SIZE..])
    .unwrap();
    dst[COE_HEADER_SIZE + SDO_HEADER_SIZE..SDO_REQUEST_SIZE].fill(0);
    SDO_REQUEST_SIZE
}

/// request for the next segment of a segmented upload
pub fn upload_segment_request(dst: &mut [u8], toggle: bool) -> usize {
    CoeHeader::of(CanService::SdoRequest).pack(dst).unwrap();
    SdoSegmentHeader::new(false, u3::new(0), toggle, u3::new(command::UPLOAD_SEGMENT_REQUEST))
        .pack(&mut dst[COE_HEADER_SIZE..])
        .unwrap();
    // pad to the CAN frame size expected for this request
    dst[COE_HEADER_SIZE + SDO_SEGMENT_HEADER_SIZE..SDO_REQUEST_SIZE].fill(0);
    SDO_REQUEST_SIZE
}

/// download request carrying the whole data in the 4-byte expedited area
pub fn download_expedited_request(dst: &mut [u8], sdo: Sdo, data: &[u8]) -> usize {
    debug_assert!(data.len() <= EXPEDITED_MAX_SIZE);
    CoeHeader::of(CanService::SdoRequest).pack(dst).unwrap();
    SdoHeader::new(
        true,
        true,
        u2::new((EXPEDITED_MAX_SIZE - data.len()) as u8),
        sdo.complete,
        u3::new(command::DOWNLOAD_REQUEST),
        sdo.index,
        sdo.sub,
    )
    .pack(&mut dst[COE_HEADER_SIZE..])
    .unwrap();
    let area = &mut dst[COE_HEADER_SIZE + SDO_HEADER_SIZE..SDO_REQUEST_SIZE];
    area.fill(0);
    area[..data.len()].copy_from_slice(data);
    SDO_REQUEST_SIZE
}

/// download request announcing `total` bytes to come in segments
pub fn download_normal_request(dst: &mut [u8], sdo: Sdo, total: u32) -> usize {
    CoeHeader::of(CanService::SdoRequest).pack(dst).unwrap();
    SdoHeader::new(
        true,
        false,
        u2::new(0),
        sdo.complete,
        u3::new(command::DOWNLOAD_REQUEST),
        sdo.index,
        sdo.sub,
    )
    .pack(&mut dst[COE_HEADER_SIZE..])
    .unwrap();
    total
        .pack(&mut dst[COE_HEADER_SIZE + SDO_HEADER_SIZE..])
        .unwrap();
    SDO_REQUEST_SIZE
}

/// one segment of a segmented download
pub fn download_segment_request(dst: &mut [u8], data: &[u8], toggle: bool, more: bool) -> usize {
    CoeHeader::of(CanService::SdoRequest).pack(dst).unwrap();
    SdoSegmentHeader::new(
        more,
        u3::new((7usize.saturating_sub(data.len())).min(7) as u8),
        toggle,
        u3::new(command::DOWNLOAD_SEGMENT_REQUEST),
    )
    .pack(&mut dst[COE_HEADER_SIZE..])
    .unwrap();
    dst[COE_HEADER_SIZE + SDO_SEGMENT_HEADER_SIZE..][..data.len()].copy_from_slice(data);
    COE_HEADER_SIZE + SDO_SEGMENT_HEADER_SIZE + data.len()
}
