//! Typed payloads for the packet types the core answers itself.
//!
//! Payloads are opaque to the framing layer; these structs give handlers
//! and tests one place that knows the field layout. Everything else on
//! the wire stays raw.

use crate::{packet::Packet, CodecError, PacketType};

/// A payload that knows how to move through a [`Packet`].
pub trait PacketPayload: Sized {
    const TYPE: PacketType;

    fn write_to(&self, packet: &mut Packet) -> Result<(), CodecError>;
    fn read_from(packet: &mut Packet) -> Result<Self, CodecError>;

    /// Builds a frame of [`Self::TYPE`] carrying this payload.
    fn to_packet(&self) -> Result<Packet, CodecError> {
        let mut packet = Packet::build(Self::TYPE);
        self.write_to(&mut packet)?;
        Ok(packet)
    }

    /// Reads the payload from a received frame, rewinding to the payload
    /// start first.
    fn from_packet(packet: &mut Packet) -> Result<Self, CodecError> {
        packet.seek_to_payload(0)?;
        Self::read_from(packet)
    }
}

/// Client login request. The credential fields are resolved by the auth
/// service; the core only routes them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MsgLoginGame {
    pub account_id: u32,
    pub token: u32,
}

impl PacketPayload for MsgLoginGame {
    const TYPE: PacketType = PacketType::C_MSG_LOGIN_GAME;

    fn write_to(&self, packet: &mut Packet) -> Result<(), CodecError> {
        packet.write_u32(self.account_id)?;
        packet.write_u32(self.token)
    }

    fn read_from(packet: &mut Packet) -> Result<Self, CodecError> {
        Ok(Self {
            account_id: packet.read_u32()?,
            token: packet.read_u32()?,
        })
    }
}

/// Server login acknowledgement (`LoginGamaEnglish`): the player's uid
/// and a state word, zero meaning success.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MsgLoginResponse {
    pub uid: u32,
    pub state: u32,
}

impl PacketPayload for MsgLoginResponse {
    const TYPE: PacketType = PacketType::LOGIN_GAMA_ENGLISH;

    fn write_to(&self, packet: &mut Packet) -> Result<(), CodecError> {
        packet.write_u32(self.uid)?;
        packet.write_u32(self.state)
    }

    fn read_from(packet: &mut Packet) -> Result<Self, CodecError> {
        Ok(Self {
            uid: packet.read_u32()?,
            state: packet.read_u32()?,
        })
    }
}

/// A chat line: a `u16` length and that many UTF-8 bytes.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MsgTalk {
    pub text: String,
}

impl PacketPayload for MsgTalk {
    const TYPE: PacketType = PacketType::C_MSG_TALK;

    fn write_to(&self, packet: &mut Packet) -> Result<(), CodecError> {
        packet.write_u16(self.text.len() as u16)?;
        packet.write_bytes(self.text.as_bytes())
    }

    fn read_from(packet: &mut Packet) -> Result<Self, CodecError> {
        let len = packet.read_u16()? as usize;
        let text = packet.read_string(len)?;
        Ok(Self { text })
    }
}

/// A world action request. Walks carry the target coordinates.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MsgAction {
    pub action: u16,
    pub x: i16,
    pub y: i16,
}

impl MsgAction {
    pub const WALK: u16 = 1;
}

impl PacketPayload for MsgAction {
    const TYPE: PacketType = PacketType::C_MSG_ACTION;

    fn write_to(&self, packet: &mut Packet) -> Result<(), CodecError> {
        packet.write_u16(self.action)?;
        packet.write_i16(self.x)?;
        packet.write_i16(self.y)
    }

    fn read_from(packet: &mut Packet) -> Result<Self, CodecError> {
        Ok(Self {
            action: packet.read_u16()?,
            x: packet.read_i16()?,
            y: packet.read_i16()?,
        })
    }
}

/// The server's echo of an action: the settled coordinates plus whether
/// the request was accepted.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MsgActionResponse {
    pub action: u16,
    pub x: i16,
    pub y: i16,
    pub accepted: bool,
}

impl PacketPayload for MsgActionResponse {
    const TYPE: PacketType = PacketType::C_MSG_ACTION;

    fn write_to(&self, packet: &mut Packet) -> Result<(), CodecError> {
        packet.write_u16(self.action)?;
        packet.write_i16(self.x)?;
        packet.write_i16(self.y)?;
        packet.write_u8(u8::from(self.accepted))
    }

    fn read_from(packet: &mut Packet) -> Result<Self, CodecError> {
        Ok(Self {
            action: packet.read_u16()?,
            x: packet.read_i16()?,
            y: packet.read_i16()?,
            accepted: packet.read_u8()? != 0,
        })
    }
}
