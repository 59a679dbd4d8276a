use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::CodecId;
use crate::error::WireError;
use crate::reason::StreamErrorReason;

/// Message type byte values (`spec.md` §6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    VideoFrame = 0x01,
    AudioFrame = 0x02,
    Keyboard = 0x10,
    MouseClickWheel = 0x11,
    MouseAbsolute = 0x12,
    MouseRelative = 0x13,
    Touch = 0x14,
    ControllerEvent = 0x15,
    ControllerState = 0x16,
    ControlMessage = 0x20,
    StreamInit = 0x30,
    StreamError = 0x31,
    Ping = 0x40,
    Pong = 0x41,
}

impl MessageType {
    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x01 => Self::VideoFrame,
            0x02 => Self::AudioFrame,
            0x10 => Self::Keyboard,
            0x11 => Self::MouseClickWheel,
            0x12 => Self::MouseAbsolute,
            0x13 => Self::MouseRelative,
            0x14 => Self::Touch,
            0x15 => Self::ControllerEvent,
            0x16 => Self::ControllerState,
            0x20 => Self::ControlMessage,
            0x30 => Self::StreamInit,
            0x31 => Self::StreamError,
            0x40 => Self::Ping,
            0x41 => Self::Pong,
            _ => return None,
        })
    }
}

/// Sub-kind carried by a `0x15` `ControllerEvent` message. The wire layout
/// only fixes `controller_id` and `sub`; the remaining payload is opaque to
/// this crate and interpreted by the Input Injector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerEventKind {
    ButtonDelta,
    AxisDelta,
    Other(u8),
}

impl ControllerEventKind {
    fn from_byte(b: u8) -> Self {
        match b {
            0 => Self::ButtonDelta,
            1 => Self::AxisDelta,
            other => Self::Other(other),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Self::ButtonDelta => 0,
            Self::AxisDelta => 1,
            Self::Other(b) => b,
        }
    }
}

/// A decoded wire message. Variants mirror the table in `spec.md` §6.1
/// exactly — one per message type (sub-typed messages sharing a type byte,
/// e.g. `MouseButton`/`WheelHiRes`/`WheelLoRes` under `0x11`, get distinct
/// variants here for ergonomic matching at the call site).
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    StreamInit {
        codec: CodecId,
        width: u16,
        height: u16,
        fps: u8,
        audio_channels: u8,
        sample_rate: u32,
        touch_support: bool,
    },
    StreamError {
        reason: StreamErrorReason,
        message: String,
    },
    VideoFrame {
        codec: CodecId,
        is_keyframe: bool,
        pts_us: u64,
        width: u16,
        height: u16,
        payload: Bytes,
    },
    AudioFrame {
        pts_us: u64,
        channels: u8,
        payload: Bytes,
    },
    Keyboard {
        is_down: bool,
        modifiers: u8,
        keycode: u16,
    },
    MouseButton {
        is_down: bool,
        button: u8,
    },
    WheelHiRes {
        dx: i16,
        dy: i16,
    },
    WheelLoRes {
        dx: i8,
        dy: i8,
    },
    MouseAbsolute {
        x: i16,
        y: i16,
        ref_w: i16,
        ref_h: i16,
    },
    MouseRelative {
        dx: i16,
        dy: i16,
    },
    Touch {
        phase: u8,
        touch_id: u8,
        x: i16,
        y: i16,
    },
    ControllerEvent {
        controller_id: u8,
        kind: ControllerEventKind,
        payload: Bytes,
    },
    ControllerState {
        controller_id: u8,
        buttons: u32,
        lt: u8,
        rt: u8,
        lx: i16,
        ly: i16,
        rx: i16,
        ry: i16,
    },
    Ping {
        seq: u32,
        client_us: u64,
    },
    Pong {
        seq: u32,
        client_us: u64,
        server_us: u64,
    },
    ControlMessage {
        payload: Bytes,
    },
}

impl Message {
    /// Encode this message as a complete binary WebSocket frame, type byte
    /// included.
    #[must_use]
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        match self {
            Self::StreamInit {
                codec,
                width,
                height,
                fps,
                audio_channels,
                sample_rate,
                touch_support,
            } => {
                buf.put_u8(MessageType::StreamInit as u8);
                buf.put_u8(codec.to_byte());
                buf.put_u16(*width);
                buf.put_u16(*height);
                buf.put_u8(*fps);
                buf.put_u8(*audio_channels);
                buf.put_u32(*sample_rate);
                buf.put_u8(u8::from(*touch_support));
            }
            Self::StreamError { reason, message } => {
                buf.put_u8(MessageType::StreamError as u8);
                buf.put_u8(reason.to_byte());
                let bytes = message.as_bytes();
                #[allow(clippy::cast_possible_truncation)]
                buf.put_u16(bytes.len() as u16);
                buf.put_slice(bytes);
            }
            Self::VideoFrame {
                codec,
                is_keyframe,
                pts_us,
                width,
                height,
                payload,
            } => {
                buf.put_u8(MessageType::VideoFrame as u8);
                buf.put_u8(codec.to_byte());
                buf.put_u8(u8::from(*is_keyframe));
                buf.put_u64(*pts_us);
                buf.put_u16(*width);
                buf.put_u16(*height);
                buf.put_slice(payload);
            }
            Self::AudioFrame {
                pts_us,
                channels,
                payload,
            } => {
                buf.put_u8(MessageType::AudioFrame as u8);
                buf.put_u64(*pts_us);
                buf.put_u8(*channels);
                buf.put_slice(payload);
            }
            Self::Keyboard {
                is_down,
                modifiers,
                keycode,
            } => {
                buf.put_u8(MessageType::Keyboard as u8);
                buf.put_u8(0); // sub = 0
                buf.put_u8(u8::from(*is_down));
                buf.put_u8(*modifiers);
                buf.put_u16(*keycode);
            }
            Self::MouseButton { is_down, button } => {
                buf.put_u8(MessageType::MouseClickWheel as u8);
                buf.put_u8(2);
                buf.put_u8(u8::from(*is_down));
                buf.put_u8(*button);
            }
            Self::WheelHiRes { dx, dy } => {
                buf.put_u8(MessageType::MouseClickWheel as u8);
                buf.put_u8(3);
                buf.put_i16(*dx);
                buf.put_i16(*dy);
            }
            Self::WheelLoRes { dx, dy } => {
                buf.put_u8(MessageType::MouseClickWheel as u8);
                buf.put_u8(4);
                buf.put_i8(*dx);
                buf.put_i8(*dy);
            }
            Self::MouseAbsolute { x, y, ref_w, ref_h } => {
                buf.put_u8(MessageType::MouseAbsolute as u8);
                buf.put_u8(1);
                buf.put_i16(*x);
                buf.put_i16(*y);
                buf.put_i16(*ref_w);
                buf.put_i16(*ref_h);
            }
            Self::MouseRelative { dx, dy } => {
                buf.put_u8(MessageType::MouseRelative as u8);
                buf.put_u8(0);
                buf.put_i16(*dx);
                buf.put_i16(*dy);
            }
            Self::Touch { phase, touch_id, x, y } => {
                buf.put_u8(MessageType::Touch as u8);
                buf.put_u8(*phase);
                buf.put_u8(*touch_id);
                buf.put_i16(*x);
                buf.put_i16(*y);
            }
            Self::ControllerEvent {
                controller_id,
                kind,
                payload,
            } => {
                buf.put_u8(MessageType::ControllerEvent as u8);
                buf.put_u8(*controller_id);
                buf.put_u8(kind.to_byte());
                buf.put_slice(payload);
            }
            Self::ControllerState {
                controller_id,
                buttons,
                lt,
                rt,
                lx,
                ly,
                rx,
                ry,
            } => {
                buf.put_u8(MessageType::ControllerState as u8);
                buf.put_u8(*controller_id);
                buf.put_u32(*buttons);
                buf.put_u8(*lt);
                buf.put_u8(*rt);
                buf.put_i16(*lx);
                buf.put_i16(*ly);
                buf.put_i16(*rx);
                buf.put_i16(*ry);
            }
            Self::Ping { seq, client_us } => {
                buf.put_u8(MessageType::Ping as u8);
                buf.put_u32(*seq);
                buf.put_u64(*client_us);
            }
            Self::Pong {
                seq,
                client_us,
                server_us,
            } => {
                buf.put_u8(MessageType::Pong as u8);
                buf.put_u32(*seq);
                buf.put_u64(*client_us);
                buf.put_u64(*server_us);
            }
            Self::ControlMessage { payload } => {
                buf.put_u8(MessageType::ControlMessage as u8);
                buf.put_slice(payload);
            }
        }
        buf
    }

    /// Decode one complete binary WebSocket frame into a `Message`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] if the frame is empty, the type byte is
    /// unrecognized, the frame is undersized for its declared type, or a
    /// fixed sub-type field doesn't match the value the layout requires.
    /// Per `spec.md` §4.2 the caller decides whether to drop-and-log or
    /// close the connection; this function never does either.
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        if buf.is_empty() {
            return Err(WireError::Empty);
        }
        let type_byte = buf.get_u8();
        let ty = MessageType::from_byte(type_byte).ok_or(WireError::UnknownType(type_byte))?;

        let need = |min: usize, have: usize| -> Result<(), WireError> {
            if have < min {
                Err(WireError::Undersized(type_byte, min, have))
            } else {
                Ok(())
            }
        };

        match ty {
            MessageType::StreamInit => {
                need(12, buf.len())?;
                let codec = CodecId::from_byte(buf.get_u8()).ok_or(WireError::UnknownType(type_byte))?;
                let width = buf.get_u16();
                let height = buf.get_u16();
                let fps = buf.get_u8();
                let audio_channels = buf.get_u8();
                let sample_rate = buf.get_u32();
                let touch_support = buf.get_u8() != 0;
                Ok(Self::StreamInit {
                    codec,
                    width,
                    height,
                    fps,
                    audio_channels,
                    sample_rate,
                    touch_support,
                })
            }
            MessageType::StreamError => {
                need(3, buf.len())?;
                let reason = StreamErrorReason::from_byte(buf.get_u8())
                    .ok_or(WireError::BadSubType(0, type_byte))?;
                let len = usize::from(buf.get_u16());
                need(len, buf.len())?;
                let msg_bytes = buf.split_to(len);
                let message = String::from_utf8(msg_bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)?;
                Ok(Self::StreamError { reason, message })
            }
            MessageType::VideoFrame => {
                need(14, buf.len())?;
                let codec = CodecId::from_byte(buf.get_u8()).ok_or(WireError::UnknownType(type_byte))?;
                let flags = buf.get_u8();
                let pts_us = buf.get_u64();
                let width = buf.get_u16();
                let height = buf.get_u16();
                let payload = buf;
                Ok(Self::VideoFrame {
                    codec,
                    is_keyframe: flags & 0x01 != 0,
                    pts_us,
                    width,
                    height,
                    payload,
                })
            }
            MessageType::AudioFrame => {
                need(9, buf.len())?;
                let pts_us = buf.get_u64();
                let channels = buf.get_u8();
                let payload = buf;
                Ok(Self::AudioFrame {
                    pts_us,
                    channels,
                    payload,
                })
            }
            MessageType::Keyboard => {
                need(5, buf.len())?;
                let sub = buf.get_u8();
                if sub != 0 {
                    return Err(WireError::BadSubType(sub, type_byte));
                }
                let is_down = buf.get_u8() != 0;
                let modifiers = buf.get_u8();
                let keycode = buf.get_u16();
                Ok(Self::Keyboard {
                    is_down,
                    modifiers,
                    keycode,
                })
            }
            MessageType::MouseClickWheel => {
                need(1, buf.len())?;
                let sub = buf.get_u8();
                match sub {
                    2 => {
                        need(2, buf.len())?;
                        let is_down = buf.get_u8() != 0;
                        let button = buf.get_u8();
                        Ok(Self::MouseButton { is_down, button })
                    }
                    3 => {
                        need(4, buf.len())?;
                        let dx = buf.get_i16();
                        let dy = buf.get_i16();
                        Ok(Self::WheelHiRes { dx, dy })
                    }
                    4 => {
                        need(2, buf.len())?;
                        let dx = buf.get_i8();
                        let dy = buf.get_i8();
                        Ok(Self::WheelLoRes { dx, dy })
                    }
                    other => Err(WireError::BadSubType(other, type_byte)),
                }
            }
            MessageType::MouseAbsolute => {
                need(9, buf.len())?;
                let sub = buf.get_u8();
                if sub != 1 {
                    return Err(WireError::BadSubType(sub, type_byte));
                }
                let x = buf.get_i16();
                let y = buf.get_i16();
                let ref_w = buf.get_i16();
                let ref_h = buf.get_i16();
                Ok(Self::MouseAbsolute { x, y, ref_w, ref_h })
            }
            MessageType::MouseRelative => {
                need(5, buf.len())?;
                let sub = buf.get_u8();
                if sub != 0 {
                    return Err(WireError::BadSubType(sub, type_byte));
                }
                let dx = buf.get_i16();
                let dy = buf.get_i16();
                Ok(Self::MouseRelative { dx, dy })
            }
            MessageType::Touch => {
                need(6, buf.len())?;
                let phase = buf.get_u8();
                let touch_id = buf.get_u8();
                let x = buf.get_i16();
                let y = buf.get_i16();
                Ok(Self::Touch { phase, touch_id, x, y })
            }
            MessageType::ControllerEvent => {
                need(2, buf.len())?;
                let controller_id = buf.get_u8();
                let kind = ControllerEventKind::from_byte(buf.get_u8());
                let payload = buf;
                Ok(Self::ControllerEvent {
                    controller_id,
                    kind,
                    payload,
                })
            }
            MessageType::ControllerState => {
                need(15, buf.len())?;
                let controller_id = buf.get_u8();
                let buttons = buf.get_u32();
                let lt = buf.get_u8();
                let rt = buf.get_u8();
                let lx = buf.get_i16();
                let ly = buf.get_i16();
                let rx = buf.get_i16();
                let ry = buf.get_i16();
                Ok(Self::ControllerState {
                    controller_id,
                    buttons,
                    lt,
                    rt,
                    lx,
                    ly,
                    rx,
                    ry,
                })
            }
            MessageType::Ping => {
                need(12, buf.len())?;
                let seq = buf.get_u32();
                let client_us = buf.get_u64();
                Ok(Self::Ping { seq, client_us })
            }
            MessageType::Pong => {
                need(20, buf.len())?;
                let seq = buf.get_u32();
                let client_us = buf.get_u64();
                let server_us = buf.get_u64();
                Ok(Self::Pong {
                    seq,
                    client_us,
                    server_us,
                })
            }
            MessageType::ControlMessage => Ok(Self::ControlMessage { payload: buf }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let encoded = msg.encode().freeze();
        let decoded = Message::decode(encoded).expect("decode should succeed");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn stream_init_round_trip() {
        roundtrip(Message::StreamInit {
            codec: CodecId::H264,
            width: 1920,
            height: 1080,
            fps: 60,
            audio_channels: 2,
            sample_rate: 48000,
            touch_support: true,
        });
    }

    #[test]
    fn stream_error_round_trip() {
        roundtrip(Message::StreamError {
            reason: StreamErrorReason::NoCompatibleCodec,
            message: "no overlap".to_string(),
        });
    }

    #[test]
    fn video_frame_round_trip() {
        roundtrip(Message::VideoFrame {
            codec: CodecId::H264,
            is_keyframe: true,
            pts_us: 12_345,
            width: 1920,
            height: 1080,
            payload: Bytes::from_static(&[0, 0, 0, 1, 0x67]),
        });
    }

    #[test]
    fn audio_frame_round_trip() {
        roundtrip(Message::AudioFrame {
            pts_us: 999,
            channels: 2,
            payload: Bytes::from_static(&[1, 2, 3]),
        });
    }

    #[test]
    fn keyboard_round_trip() {
        roundtrip(Message::Keyboard {
            is_down: true,
            modifiers: 0,
            keycode: 30,
        });
    }

    #[test]
    fn mouse_button_wheel_variants_round_trip() {
        roundtrip(Message::MouseButton {
            is_down: true,
            button: 0,
        });
        roundtrip(Message::WheelHiRes { dx: -120, dy: 120 });
        roundtrip(Message::WheelLoRes { dx: -1, dy: 1 });
    }

    #[test]
    fn mouse_absolute_round_trip() {
        roundtrip(Message::MouseAbsolute {
            x: 500,
            y: 400,
            ref_w: 1920,
            ref_h: 1080,
        });
    }

    #[test]
    fn mouse_relative_round_trip() {
        roundtrip(Message::MouseRelative { dx: 10, dy: -10 });
    }

    #[test]
    fn touch_round_trip() {
        roundtrip(Message::Touch {
            phase: 0,
            touch_id: 3,
            x: 100,
            y: 200,
        });
    }

    #[test]
    fn controller_state_round_trip() {
        roundtrip(Message::ControllerState {
            controller_id: 0,
            buttons: 0xDEAD_BEEF,
            lt: 255,
            rt: 0,
            lx: -32768,
            ly: 32767,
            rx: 0,
            ry: 0,
        });
    }

    #[test]
    fn ping_pong_round_trip() {
        roundtrip(Message::Ping {
            seq: 7,
            client_us: 1_000,
        });
        roundtrip(Message::Pong {
            seq: 7,
            client_us: 1_000,
            server_us: 1_050,
        });
    }

    #[test]
    fn empty_frame_is_error() {
        assert_eq!(Message::decode(Bytes::new()), Err(WireError::Empty));
    }

    #[test]
    fn unknown_type_byte_is_error() {
        assert_eq!(
            Message::decode(Bytes::from_static(&[0xEE])),
            Err(WireError::UnknownType(0xEE))
        );
    }

    #[test]
    fn undersized_ping_is_error() {
        // Ping needs 12 bytes after the type byte; give it 2.
        let buf = Bytes::from_static(&[0x40, 0x00, 0x00]);
        assert_eq!(Message::decode(buf), Err(WireError::Undersized(0x40, 12, 2)));
    }

    #[test]
    fn bad_sub_type_is_error() {
        let buf = Bytes::from_static(&[0x11, 0x09]);
        assert_eq!(Message::decode(buf), Err(WireError::BadSubType(0x09, 0x11)));
    }

    // The variants below are decoded from untrusted viewer input (`spec.md`
    // §4.2: "undersized payload ... is logged and dropped; the connection
    // is not closed"). Each of these must return `Err(Undersized(..))`
    // rather than panic on a short `get_*` read — the bug this was written
    // to catch was an off-by-N `need()` count that still let a too-short
    // frame through the check.

    #[test]
    fn undersized_stream_init_is_error() {
        let buf = Bytes::from_static(&[0x30, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(Message::decode(buf), Err(WireError::Undersized(0x30, 12, 11)));
    }

    #[test]
    fn undersized_video_frame_is_error() {
        let buf = Bytes::from_static(&[0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(Message::decode(buf), Err(WireError::Undersized(0x01, 14, 13)));
    }

    #[test]
    fn undersized_keyboard_is_error() {
        let buf = Bytes::from_static(&[0x10, 0x00, 0x01, 0x00, 0x00]);
        assert_eq!(Message::decode(buf), Err(WireError::Undersized(0x10, 5, 4)));
    }

    #[test]
    fn undersized_mouse_button_is_error() {
        let buf = Bytes::from_static(&[0x11, 0x02, 0x01]);
        assert_eq!(Message::decode(buf), Err(WireError::Undersized(0x11, 2, 1)));
    }

    #[test]
    fn undersized_wheel_hi_res_is_error() {
        let buf = Bytes::from_static(&[0x11, 0x03, 0x00, 0x00]);
        assert_eq!(Message::decode(buf), Err(WireError::Undersized(0x11, 4, 2)));
    }

    #[test]
    fn undersized_wheel_lo_res_is_error() {
        let buf = Bytes::from_static(&[0x11, 0x04, 0x00]);
        assert_eq!(Message::decode(buf), Err(WireError::Undersized(0x11, 2, 1)));
    }

    #[test]
    fn undersized_mouse_absolute_is_error() {
        let buf = Bytes::from_static(&[0x12, 1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(Message::decode(buf), Err(WireError::Undersized(0x12, 9, 8)));
    }

    #[test]
    fn undersized_mouse_relative_is_error() {
        let buf = Bytes::from_static(&[0x13, 0, 0, 0, 0]);
        assert_eq!(Message::decode(buf), Err(WireError::Undersized(0x13, 5, 4)));
    }

    #[test]
    fn undersized_touch_is_error() {
        let buf = Bytes::from_static(&[0x14, 0, 0, 0, 0, 0]);
        assert_eq!(Message::decode(buf), Err(WireError::Undersized(0x14, 6, 5)));
    }

    #[test]
    fn undersized_controller_event_is_error() {
        let buf = Bytes::from_static(&[0x15, 0]);
        assert_eq!(Message::decode(buf), Err(WireError::Undersized(0x15, 2, 1)));
    }

    #[test]
    fn undersized_controller_state_is_error() {
        let buf = Bytes::from_static(&[0x16, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(Message::decode(buf), Err(WireError::Undersized(0x16, 15, 14)));
    }
}
