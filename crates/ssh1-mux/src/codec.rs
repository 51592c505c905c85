use std::io;

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use rand::Rng as _;
use ssh1_proto::Message;
use tokio_util::codec::{Decoder, Encoder};

use crate::transport::TransportCapabilities;

/// Largest accepted value of the length field.
pub(crate) const MAXIMUM_PACKET_SIZE_IN_BYTES: usize = 256 * 1024; // 256 kiB

const LENGTH_FIELD_SIZE: usize = 4;
const CRC_SIZE: usize = 4;

/// SSH1 binary packet framing.
///
/// ```text
/// u32     length (type + data + crc)
/// [u8]    padding, 8 - length % 8 bytes
/// u8      type
/// [u8]    data
/// u32     crc32 of padding + type + data
/// ```
///
/// Decoded items are the raw type tag and data, so that decoding failures of individual
/// messages can be told apart from a corrupted stream.
pub struct PacketCodec {
    capabilities: TransportCapabilities,
    scratch: BytesMut,
}

impl PacketCodec {
    pub fn new(capabilities: TransportCapabilities) -> Self {
        Self {
            capabilities,
            scratch: BytesMut::new(),
        }
    }
}

fn padding_size(length: usize) -> usize {
    8 - length % 8
}

fn framing_error(reason: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason.into())
}

impl Decoder for PacketCodec {
    type Item = Bytes;

    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        const MAX_RESERVE_CHUNK_IN_BYTES: usize = 8 * 1024; // 8 kiB

        if src.len() < LENGTH_FIELD_SIZE {
            // Not enough data to read length marker.
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..LENGTH_FIELD_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length <= CRC_SIZE {
            return Err(framing_error(format!("packet length {length} is too small")));
        }

        if length > MAXIMUM_PACKET_SIZE_IN_BYTES {
            return Err(framing_error(format!("packet length {length} exceeds the maximum")));
        }

        let padded_length = length + padding_size(length);
        let frame_length = LENGTH_FIELD_SIZE + padded_length;

        if src.len() < frame_length {
            let additional = core::cmp::min(MAX_RESERVE_CHUNK_IN_BYTES, frame_length - src.len());
            src.reserve(additional);
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_SIZE);
        let mut body = src.split_to(padded_length);

        if let Some(cipher) = self.capabilities.cipher.as_mut() {
            cipher.decrypt(&mut body);
        }

        let crc_offset = padded_length - CRC_SIZE;
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&body[crc_offset..]);
        let expected_crc = u32::from_be_bytes(crc_bytes);
        let actual_crc = crc32fast::hash(&body[..crc_offset]);

        if expected_crc != actual_crc {
            return Err(framing_error(format!(
                "CRC mismatch: expected {expected_crc:#010x}, computed {actual_crc:#010x}"
            )));
        }

        body.truncate(crc_offset);
        body.advance(padding_size(length));

        let packet = match self.capabilities.compressor.as_mut() {
            Some(compressor) => Bytes::from(compressor.uncompress(&body)?),
            None => body.freeze(),
        };

        if packet.is_empty() {
            return Err(framing_error("packet without type"));
        }

        Ok(Some(packet))
    }
}

impl Encoder<Message> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.scratch.clear();
        item.encode(&mut self.scratch);

        let compressed;
        let payload: &[u8] = match self.capabilities.compressor.as_mut() {
            Some(compressor) => {
                compressed = compressor.compress(&self.scratch)?;
                &compressed
            }
            None => &self.scratch,
        };

        let length = payload.len() + CRC_SIZE;

        if length > MAXIMUM_PACKET_SIZE_IN_BYTES {
            return Err(framing_error(format!("outgoing packet length {length} exceeds the maximum")));
        }

        let padding = padding_size(length);
        dst.reserve(LENGTH_FIELD_SIZE + length + padding);

        dst.put_u32(u32::try_from(length).map_err(|_| framing_error("packet length overflow"))?);

        let body_start = dst.len();

        if self.capabilities.cipher.is_some() {
            let mut random_padding = [0u8; 8];
            rand::thread_rng().fill(&mut random_padding[..padding]);
            dst.put_slice(&random_padding[..padding]);
        } else {
            dst.put_bytes(0, padding);
        }

        dst.put_slice(payload);

        let crc = crc32fast::hash(&dst[body_start..]);
        dst.put_u32(crc);

        if let Some(cipher) = self.capabilities.cipher.as_mut() {
            cipher.encrypt(&mut dst[body_start..]);
        }

        Ok(())
    }
}
