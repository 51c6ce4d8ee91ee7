//! Wire codec for the channel message header.
//!
//! Every datagram on the managed mailbox starts with a fixed 20-byte header,
//! all multi-byte fields in network byte order, no padding:
//!
//! ```text
//! offset  size  field
//!      0     4  src_destid
//!      4     4  dst_destid
//!      8     1  src_mbox
//!      9     1  dst_mbox
//!     10     1  packet_type   (0xAA = system, 0x55 = channel)
//!     11     1  ch_op         (0 = CONN_REQ, 1 = CONN_ACK, 2 = CONN_CLOSE, 3 = DATA)
//!     12     2  dst_ch
//!     14     2  src_ch
//!     16     2  msg_len       (bytes including header; error code for NACK)
//!     18     2  reserved      (transmitted as zero, ignored on receipt)
//! ```

use crate::types::{ChanId, DestId, MboxId};
use bytes::{Buf, BufMut};
use thiserror::Error;

/// Length of the channel message header in bytes.
pub const HDR_LEN: usize = 20;

/// Maximum datagram size the transport carries, header included.
pub const MAX_MSG_SIZE: usize = 4096;

/// Top-level packet class carried on the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// System management packet; not handled by the channel engine.
    System = 0xaa,
    /// Channel packet (handshake or data).
    Channel = 0x55,
}

/// Channel operation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChanOp {
    ConnReq = 0,
    ConnAck = 1,
    ConnClose = 2,
    Data = 3,
}

/// Header decode errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    #[error("buffer too short for header")]
    BufferTooShort,

    #[error("unsupported packet type {0:#04x}")]
    UnsupportedType(u8),

    #[error("invalid channel op {0}")]
    InvalidOp(u8),
}

/// Channel message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub src_destid: DestId,
    pub dst_destid: DestId,
    pub src_mbox: MboxId,
    pub dst_mbox: MboxId,
    pub packet_type: PacketType,
    pub ch_op: ChanOp,
    pub dst_ch: ChanId,
    pub src_ch: ChanId,
    /// Total message length including the header. Acts as an error code in
    /// NACK-style responses.
    pub msg_len: u16,
}

impl MsgHeader {
    /// Decode a header from the front of `data`.
    ///
    /// # Errors
    /// Fails on short buffers, a packet type other than system/channel, or
    /// an out-of-range channel op.
    pub fn parse(data: &[u8]) -> Result<Self, HeaderError> {
        if data.len() < HDR_LEN {
            return Err(HeaderError::BufferTooShort);
        }

        let mut buf = data;
        let src_destid = buf.get_u32();
        let dst_destid = buf.get_u32();
        let src_mbox = buf.get_u8();
        let dst_mbox = buf.get_u8();
        let packet_type = match buf.get_u8() {
            0xaa => PacketType::System,
            0x55 => PacketType::Channel,
            other => return Err(HeaderError::UnsupportedType(other)),
        };
        let ch_op = match buf.get_u8() {
            0 => ChanOp::ConnReq,
            1 => ChanOp::ConnAck,
            2 => ChanOp::ConnClose,
            3 => ChanOp::Data,
            other => return Err(HeaderError::InvalidOp(other)),
        };
        let dst_ch = buf.get_u16();
        let src_ch = buf.get_u16();
        let msg_len = buf.get_u16();
        // reserved
        let _ = buf.get_u16();

        Ok(MsgHeader {
            src_destid,
            dst_destid,
            src_mbox,
            dst_mbox,
            packet_type,
            ch_op,
            dst_ch,
            src_ch,
            msg_len,
        })
    }

    /// Encode the header into `buf`.
    pub fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.src_destid);
        buf.put_u32(self.dst_destid);
        buf.put_u8(self.src_mbox);
        buf.put_u8(self.dst_mbox);
        buf.put_u8(self.packet_type as u8);
        buf.put_u8(self.ch_op as u8);
        buf.put_u16(self.dst_ch);
        buf.put_u16(self.src_ch);
        buf.put_u16(self.msg_len);
        buf.put_u16(0);
    }

    /// Encode the header into a fixed array.
    pub fn to_bytes(&self) -> [u8; HDR_LEN] {
        let mut out = [0u8; HDR_LEN];
        let mut slice = &mut out[..];
        self.write(&mut slice);
        out
    }
}
