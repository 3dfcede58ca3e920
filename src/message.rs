use heapless::Vec;
use serde::{Deserialize, Serialize};

pub const MAX_SYSEX_PAYLOAD: usize = 24;

pub type SysexData = Vec<u8, MAX_SYSEX_PAYLOAD>;

/// Full range of an extended-precision (SysEx encoded) parameter value.
pub const EXTENDED_VALUE_MAX: u16 = 16383;
/// Full range of a single data byte parameter value.
pub const BYTE_VALUE_MAX: u16 = 127;

/// Wire message as seen by the routing fabric and the synchronization engine.
///
/// The engine only relies on structural equality and the templates below; the
/// concrete byte encoding on the physical link is the transport's business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MidiMessage {
    ControlChange { channel: u8, control: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    SystemExclusive { manufacturer_id: [u8; 3], data: SysexData },
    /// A frame the transport could decode far enough to see a status byte but
    /// not into a known message type. Never forwarded by the router.
    Unrecognized { status: u8 },
}

impl MidiMessage {
    pub fn is_recognized(&self) -> bool {
        !matches!(self, MidiMessage::Unrecognized { .. })
    }
}

/// Message shape with a value slot, used in the three template roles of a
/// parameter mapping: `set` (carries a value outward), `response` (matched
/// structurally against inbound traffic, yields an extractable value) and, via
/// [`MessageTemplate::render`], ad-hoc request construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageTemplate {
    /// Value travels in the CC data byte. Matched on (channel, control).
    ControlChange { channel: u8, control: u8 },
    /// Value travels as the program number. Matched on channel.
    ProgramChange { channel: u8 },
    /// Value is appended to `prefix` as two 7-bit bytes (coarse, fine).
    /// Matched on manufacturer id plus exact prefix.
    SystemExclusive {
        manufacturer_id: [u8; 3],
        prefix: SysexData,
    },
}

impl MessageTemplate {
    /// Extended templates carry 14-bit values (0..=16383), all others 7-bit.
    pub fn is_extended(&self) -> bool {
        matches!(self, MessageTemplate::SystemExclusive { .. })
    }

    pub fn max_value(&self) -> u16 {
        if self.is_extended() {
            EXTENDED_VALUE_MAX
        } else {
            BYTE_VALUE_MAX
        }
    }

    /// Build the concrete wire message carrying `value`. Values beyond the
    /// template's range are clamped.
    pub fn render(&self, value: u16) -> MidiMessage {
        let value = value.min(self.max_value());

        match self {
            MessageTemplate::ControlChange { channel, control } => MidiMessage::ControlChange {
                channel: *channel,
                control: *control,
                value: value as u8,
            },
            MessageTemplate::ProgramChange { channel } => MidiMessage::ProgramChange {
                channel: *channel,
                program: value as u8,
            },
            MessageTemplate::SystemExclusive {
                manufacturer_id,
                prefix,
            } => {
                let mut data = prefix.clone();
                // Two 7-bit bytes, coarse first. Capacity is prefix + 2 by
                // construction of MAX_SYSEX_PAYLOAD sized prefixes.
                let _ = data.push(((value >> 7) & 0x7f) as u8);
                let _ = data.push((value & 0x7f) as u8);
                MidiMessage::SystemExclusive {
                    manufacturer_id: *manufacturer_id,
                    data,
                }
            }
        }
    }

    /// Structural match against an inbound message. Returns the extracted
    /// value on success, `None` if the message has a different shape.
    pub fn matches(&self, message: &MidiMessage) -> Option<u16> {
        match (self, message) {
            (
                MessageTemplate::ControlChange { channel, control },
                MidiMessage::ControlChange {
                    channel: ch,
                    control: cc,
                    value,
                },
            ) if channel == ch && control == cc => Some(u16::from(*value)),
            (
                MessageTemplate::ProgramChange { channel },
                MidiMessage::ProgramChange {
                    channel: ch,
                    program,
                },
            ) if channel == ch => Some(u16::from(*program)),
            (
                MessageTemplate::SystemExclusive {
                    manufacturer_id,
                    prefix,
                },
                MidiMessage::SystemExclusive {
                    manufacturer_id: mid,
                    data,
                },
            ) if manufacturer_id == mid
                && data.len() == prefix.len() + 2
                && data[..prefix.len()] == prefix[..] =>
            {
                let coarse = u16::from(data[prefix.len()]) & 0x7f;
                let fine = u16::from(data[prefix.len() + 1]) & 0x7f;
                Some((coarse << 7) | fine)
            }
            _ => None,
        }
    }
}

/// Convenience constructor for SysEx payload buffers.
pub fn sysex_data(bytes: &[u8]) -> SysexData {
    let mut data = SysexData::new();
    for b in bytes {
        let _ = data.push(*b);
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_change_roundtrip() {
        let template = MessageTemplate::ControlChange {
            channel: 0,
            control: 7,
        };
        assert!(!template.is_extended());
        assert_eq!(template.max_value(), 127);

        let msg = template.render(100);
        assert_eq!(
            msg,
            MidiMessage::ControlChange {
                channel: 0,
                control: 7,
                value: 100
            }
        );
        assert_eq!(template.matches(&msg), Some(100));
    }

    #[test]
    fn test_control_change_clamps_to_byte_range() {
        let template = MessageTemplate::ControlChange {
            channel: 1,
            control: 20,
        };
        let msg = template.render(4000);
        assert_eq!(
            msg,
            MidiMessage::ControlChange {
                channel: 1,
                control: 20,
                value: 127
            }
        );
    }

    #[test]
    fn test_control_change_mismatch() {
        let template = MessageTemplate::ControlChange {
            channel: 0,
            control: 7,
        };
        let wrong_control = MidiMessage::ControlChange {
            channel: 0,
            control: 8,
            value: 1,
        };
        let wrong_channel = MidiMessage::ControlChange {
            channel: 2,
            control: 7,
            value: 1,
        };
        assert_eq!(template.matches(&wrong_control), None);
        assert_eq!(template.matches(&wrong_channel), None);
    }

    #[test]
    fn test_sysex_roundtrip_extended_range() {
        let template = MessageTemplate::SystemExclusive {
            manufacturer_id: [0x00, 0x20, 0x33],
            prefix: sysex_data(&[0x02, 0x7f, 0x01]),
        };
        assert!(template.is_extended());
        assert_eq!(template.max_value(), 16383);

        let msg = template.render(12000);
        assert_eq!(template.matches(&msg), Some(12000));

        let msg = template.render(16383);
        assert_eq!(template.matches(&msg), Some(16383));
    }

    #[test]
    fn test_sysex_prefix_mismatch() {
        let template = MessageTemplate::SystemExclusive {
            manufacturer_id: [0x00, 0x20, 0x33],
            prefix: sysex_data(&[0x02, 0x7f, 0x01]),
        };
        let other = MidiMessage::SystemExclusive {
            manufacturer_id: [0x00, 0x20, 0x33],
            data: sysex_data(&[0x02, 0x7f, 0x02, 0x00, 0x10]),
        };
        assert_eq!(template.matches(&other), None);
    }

    #[test]
    fn test_unrecognized_is_not_recognized() {
        assert!(!MidiMessage::Unrecognized { status: 0xf8 }.is_recognized());
        assert!(MidiMessage::ProgramChange {
            channel: 0,
            program: 4
        }
        .is_recognized());
    }
}
