//! Binary framing of the multiplexed attach stream.
//!
//! Every frame on the attach socket is a single channel byte followed by
//! the payload. Channel 0 carries stdin towards the container; channels
//! 1-3 carry stdout, stderr, and error reports back; channel 4 carries
//! terminal resize announcements encoded as JSON.

use serde::{Deserialize, Serialize};

/// Logical channels multiplexed over the attach socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Stdin,
    Stdout,
    Stderr,
    Error,
    Resize,
}

impl Channel {
    /// The wire id prefixed to every frame on this channel.
    pub const fn id(self) -> u8 {
        match self {
            Channel::Stdin => 0,
            Channel::Stdout => 1,
            Channel::Stderr => 2,
            Channel::Error => 3,
            Channel::Resize => 4,
        }
    }

    /// Maps a wire id back to its channel, if known.
    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Channel::Stdin),
            1 => Some(Channel::Stdout),
            2 => Some(Channel::Stderr),
            3 => Some(Channel::Error),
            4 => Some(Channel::Resize),
            _ => None,
        }
    }
}

/// Encodes `payload` into a frame on `channel`.
pub fn encode(channel: Channel, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(channel.id());
    frame.extend_from_slice(payload);
    frame
}

/// Splits a frame into its raw channel id and payload.
///
/// Returns `None` for an empty frame. A frame consisting of only the
/// channel byte yields an empty payload.
pub fn split(frame: &[u8]) -> Option<(u8, &[u8])> {
    let (&id, payload) = frame.split_first()?;
    Some((id, payload))
}

/// Terminal geometry announcement sent on [`Channel::Resize`].
///
/// Field names are capitalized on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeMessage {
    #[serde(rename = "Width")]
    pub width: u16,
    #[serde(rename = "Height")]
    pub height: u16,
}

/// Status document received on [`Channel::Error`] when the remote command
/// layer reports an outcome. A `status` of `Success` is informational and
/// carries no error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorChannelStatus {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ErrorChannelStatus {
    pub fn is_success(&self) -> bool {
        self.status.as_deref() == Some("Success")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_prefixes_channel_id() {
        assert_eq!(encode(Channel::Stdin, b"ls\n"), vec![0, b'l', b's', b'\n']);
        assert_eq!(encode(Channel::Resize, b"{}"), vec![4, b'{', b'}']);
        assert_eq!(encode(Channel::Stdin, b""), vec![0]);
    }

    #[test]
    fn split_round_trips() {
        let frame = encode(Channel::Stderr, b"oops");
        let (id, payload) = split(&frame).unwrap();
        assert_eq!(Channel::from_id(id), Some(Channel::Stderr));
        assert_eq!(payload, b"oops");
    }

    #[test]
    fn split_rejects_empty_frames() {
        assert_eq!(split(&[]), None);
        assert_eq!(split(&[1]), Some((1, &[][..])));
    }

    #[test]
    fn unknown_channel_ids_are_not_mapped() {
        assert_eq!(Channel::from_id(5), None);
        assert_eq!(Channel::from_id(255), None);
    }

    #[test]
    fn resize_message_uses_capitalized_fields() {
        let message = ResizeMessage { width: 120, height: 40 };
        let json = serde_json::to_string(&message).unwrap();
        assert_eq!(json, r#"{"Width":120,"Height":40}"#);
    }

    #[test]
    fn error_channel_success_is_recognized() {
        let status: ErrorChannelStatus =
            serde_json::from_str(r#"{"status":"Success","metadata":{}}"#).unwrap();
        assert!(status.is_success());

        let status: ErrorChannelStatus = serde_json::from_str(
            r#"{"status":"Failure","message":"container not found","reason":"NotFound"}"#,
        )
        .unwrap();
        assert!(!status.is_success());
        assert_eq!(status.message.as_deref(), Some("container not found"));
    }
}
