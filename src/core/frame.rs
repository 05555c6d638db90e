use bytes::Bytes;

/// Transport-neutral websocket frame.
///
/// Transports convert their native message type into/from `WsFrame` so the
/// connection actor never sees tungstenite types.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WsFrame {
    Text(Bytes),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<WsCloseFrame>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WsCloseFrame {
    pub code: u16,
    pub reason: String,
}

impl WsFrame {
    #[inline]
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(Bytes::from(s.into()))
    }

    #[inline]
    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Self::Close(Some(WsCloseFrame {
            code,
            reason: reason.into(),
        }))
    }

    /// Payload of a data frame, `None` for control frames.
    #[inline]
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            WsFrame::Text(bytes) | WsFrame::Binary(bytes) => Some(bytes.as_ref()),
            WsFrame::Ping(_) | WsFrame::Pong(_) | WsFrame::Close(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_only_exposes_data_frames() {
        assert_eq!(WsFrame::text("{}").payload(), Some(b"{}".as_ref()));
        assert_eq!(
            WsFrame::Binary(Bytes::from_static(b"\x01")).payload(),
            Some(b"\x01".as_ref())
        );
        assert!(WsFrame::Ping(Bytes::new()).payload().is_none());
        assert!(WsFrame::close(1000, "bye").payload().is_none());
    }
}
