use crate::extensions::option::OptionExt;
use crate::midi::registry::model::Note;

use serde::de::{Error, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt::Formatter;

const U8_MSB_EXTRACTOR: u8 = 0x80;
const LOW_NIBBLE: u8 = 0x0F;

pub const NOTE_OFF: u8 = 0x80;
pub const NOTE_ON: u8 = 0x90;

/// Data byte sent with every note on/off. Pumps ignore it, but the
/// controller firmware expects a valid (MSB clear) value.
pub const VELOCITY: DataByte = DataByte(0x7F);

const SYSEX_START: u8 = 0xF0;
const SYSEX_END: u8 = 0xF7;
const SYSEX_VENDOR_HEADER: [u8; 4] = [0x00, 0x20, 0x7A, 0x05];

const SYSEX_DEVICE_RESET: u8 = 0x01;
const SYSEX_MODE_SELECT: u8 = 0x04;
const SYSEX_PARAMETER_SET: u8 = 0x02;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Status(u8);

impl Status {
    pub fn as_u8(&self) -> u8 {
        self.0
    }

    fn note(turning_on: bool, channel: Channel) -> Status {
        let family = if turning_on { NOTE_ON } else { NOTE_OFF };
        Status(family | channel.as_u8())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DataByte(u8);

impl DataByte {
    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(db: u8) -> Option<DataByte> {
        Option::when(db & U8_MSB_EXTRACTOR == 0, || DataByte(db))
    }
}

/// MIDI channel, always in the low nibble of the status byte.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Channel(u8);

impl Channel {
    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(channel: u8) -> Option<Channel> {
        Option::when(channel <= LOW_NIBBLE, || Channel(channel))
    }
}

struct ChannelVisitor;

impl<'de> Visitor<'de> for ChannelVisitor {
    type Value = Channel;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("Expecting channel to be u8 between 0 and 15.")
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: Error,
    {
        let parse_res = u8::try_from(v).ok().and_then(Channel::from_u8);

        match parse_res {
            None => Err(E::custom(format!(
                "Expecting channel to be u8 between 0 and 15. Got: {}.",
                v
            ))),
            Some(channel) => Ok(channel),
        }
    }
}

impl<'de> Deserialize<'de> for Channel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_u8(ChannelVisitor)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MidiMessage {
    pub status: Status,
    pub fst_data_byte: DataByte,
    pub snd_data_byte: DataByte,
}

impl From<MidiMessage> for [u8; 3] {
    fn from(mm: MidiMessage) -> Self {
        [
            mm.status.as_u8(),
            mm.fst_data_byte.as_u8(),
            mm.snd_data_byte.as_u8(),
        ]
    }
}

/// Maps a pump note to the note on/off command that opens or closes it.
pub fn encode(note: &Note, turning_on: bool) -> MidiMessage {
    MidiMessage {
        status: Status::note(turning_on, note.channel),
        fst_data_byte: note.pitch,
        snd_data_byte: VELOCITY,
    }
}

fn sysex(sub_command: u8, params: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(SYSEX_VENDOR_HEADER.len() + params.len() + 3);
    frame.push(SYSEX_START);
    frame.extend_from_slice(&SYSEX_VENDOR_HEADER);
    frame.push(sub_command);
    frame.extend_from_slice(params);
    frame.push(SYSEX_END);
    frame
}

/// Initialization frames for the controller board: device reset, mode
/// select and parameter set, in that order. `base_offset` must match the
/// pitch offset the registry was loaded with.
pub fn reset_frames(base_offset: DataByte) -> [Vec<u8>; 3] {
    [
        sysex(SYSEX_DEVICE_RESET, &[0x01, 0x01, base_offset.as_u8()]),
        sysex(SYSEX_MODE_SELECT, &[0x00]),
        sysex(SYSEX_PARAMETER_SET, &[0x05]),
    ]
}
