#![allow(unused_crate_dependencies)]
#![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

use bytes::BytesMut;
use proptest::collection::vec;
use proptest::prelude::*;
use ssh1_generators::any_message;
use ssh1_mux::{Message, PacketCodec, TransportCapabilities};
use tokio_util::codec::{Decoder as _, Encoder as _};

proptest! {
    /// Packets survive being delivered by the transport in arbitrary pieces.
    #[test]
    fn packets_split_at_any_point(messages in vec(any_message(), 1..8), cut in 1usize..64) {
        let mut encoder = PacketCodec::new(TransportCapabilities::default());
        let mut wire = BytesMut::new();

        let mut expected = Vec::new();
        for message in messages {
            let mut payload = BytesMut::new();
            message.encode(&mut payload);
            expected.push(payload.freeze());

            encoder.encode(message, &mut wire).unwrap();
        }

        let mut decoder = PacketCodec::new(TransportCapabilities::default());
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();

        while !wire.is_empty() {
            let piece = wire.split_to(core::cmp::min(cut, wire.len()));
            buf.extend_from_slice(&piece);

            while let Some(packet) = decoder.decode(&mut buf).unwrap() {
                decoded.push(packet);
            }
        }

        prop_assert!(buf.is_empty());
        prop_assert_eq!(&expected, &decoded);

        for packet in decoded {
            let len = packet.len();
            let message = Message::decode(packet).unwrap();
            prop_assert_eq!(len, message.size());
        }
    }
}
