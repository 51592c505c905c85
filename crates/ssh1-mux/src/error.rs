use ssh1_proto::LocalChannelId;

/// Failures raised while multiplexing channels over the transport.
///
/// Only some of them end the connection, see [`TunnelError::is_fatal`].
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("message addressed to unknown channel {id}")]
    UnknownChannel { id: LocalChannelId },

    #[error("open confirmation on already-open channel {id}")]
    AlreadyOpen { id: LocalChannelId },

    #[error("unsupported message type {tag}")]
    UnsupportedMessageType { tag: u8 },

    #[error("malformed message: {0}")]
    MalformedMessage(#[source] ssh1_proto::Error),

    #[error("peer refused to open channel {id}")]
    OpenRejected { id: LocalChannelId },

    #[error("malformed payload: {reason}")]
    MalformedPayload { reason: String },

    #[error("local I/O failure")]
    LocalIoFailure(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("no more channel ID available")]
    Exhausted,
}

impl TunnelError {
    /// Fatal errors are reported to the peer with a disconnect and tear the whole session down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::UnknownChannel { .. }
                | TunnelError::AlreadyOpen { .. }
                | TunnelError::UnsupportedMessageType { .. }
                | TunnelError::MalformedMessage(_)
                | TunnelError::Framing(_)
        )
    }

    pub(crate) fn malformed_payload(reason: impl Into<String>) -> Self {
        TunnelError::MalformedPayload { reason: reason.into() }
    }
}

impl From<ssh1_proto::Error> for TunnelError {
    fn from(error: ssh1_proto::Error) -> Self {
        match error {
            ssh1_proto::Error::UnsupportedMessageType { tag } => TunnelError::UnsupportedMessageType { tag },
            other => TunnelError::MalformedMessage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality() {
        let id = LocalChannelId::from(99);
        assert!(TunnelError::UnknownChannel { id }.is_fatal());
        assert!(TunnelError::AlreadyOpen { id }.is_fatal());
        assert!(TunnelError::UnsupportedMessageType { tag: 26 }.is_fatal());
        assert!(!TunnelError::OpenRejected { id }.is_fatal());
        assert!(!TunnelError::malformed_payload("bad octet").is_fatal());
        assert!(!TunnelError::LocalIoFailure(std::io::ErrorKind::BrokenPipe.into()).is_fatal());
    }

    #[test]
    fn unsupported_tag_from_decoding_error() {
        let error = TunnelError::from(ssh1_proto::Error::UnsupportedMessageType { tag: 26 });
        assert!(matches!(error, TunnelError::UnsupportedMessageType { tag: 26 }));
        assert_eq!("unsupported message type 26", error.to_string());
    }

    #[test]
    fn disconnect_reason_for_unknown_channel() {
        let error = TunnelError::UnknownChannel {
            id: LocalChannelId::from(99),
        };
        assert_eq!("message addressed to unknown channel l#99", error.to_string());
    }
}
