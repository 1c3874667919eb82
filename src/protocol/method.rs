//! Protocol methods exchanged on method frames.
//!
//! Only the methods the broker acts on are modelled. Decoding anything else
//! yields [`DecodeError::UnknownMethod`], which the channel reports as
//! `NOT_IMPLEMENTED`.

use bytes::{BufMut, Bytes, BytesMut};

use super::{
    DecodeError,
    FieldTable,
    class::{BASIC, CHANNEL, CONNECTION, EXCHANGE, QUEUE},
    wire::{WireReader, bit, pack_bits, put_long_bytes, put_short_str},
};
use crate::codec::{FrameType, WireFrame};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionStart {
    pub version_major: u8,
    pub version_minor: u8,
    pub server_properties: FieldTable,
    pub mechanisms: String,
    pub locales: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionStartOk {
    pub client_properties: FieldTable,
    pub mechanism: String,
    pub response: Bytes,
    pub locale: String,
}

/// Arguments of both `connection.tune` and `connection.tune-ok`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tune {
    pub channel_max: u16,
    pub frame_max: u32,
    /// Heartbeat interval in seconds; zero disables heartbeats.
    pub heartbeat: u16,
}

/// Arguments of both `connection.close` and `channel.close`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Close {
    pub reply_code: u16,
    pub reply_text: String,
    pub class_id: u16,
    pub method_id: u16,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExchangeDeclare {
    pub exchange: String,
    pub kind: String,
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub no_wait: bool,
    pub arguments: FieldTable,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExchangeDelete {
    pub exchange: String,
    pub if_unused: bool,
    pub no_wait: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueueDeclare {
    pub queue: String,
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub no_wait: bool,
    pub arguments: FieldTable,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueDeclareOk {
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueueBind {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub no_wait: bool,
    pub arguments: FieldTable,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueueUnbind {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub arguments: FieldTable,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueDelete {
    pub queue: String,
    pub if_unused: bool,
    pub if_empty: bool,
    pub no_wait: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BasicPublish {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BasicReturn {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
}

/// A decoded method frame payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Method {
    ConnectionStart(ConnectionStart),
    ConnectionStartOk(ConnectionStartOk),
    ConnectionSecure { challenge: Bytes },
    ConnectionSecureOk { response: Bytes },
    ConnectionTune(Tune),
    ConnectionTuneOk(Tune),
    ConnectionOpen { virtual_host: String },
    ConnectionOpenOk,
    ConnectionClose(Close),
    ConnectionCloseOk,
    ChannelOpen,
    ChannelOpenOk,
    ChannelFlow { active: bool },
    ChannelFlowOk { active: bool },
    ChannelClose(Close),
    ChannelCloseOk,
    ExchangeDeclare(ExchangeDeclare),
    ExchangeDeclareOk,
    ExchangeDelete(ExchangeDelete),
    ExchangeDeleteOk,
    QueueDeclare(QueueDeclare),
    QueueDeclareOk(QueueDeclareOk),
    QueueBind(QueueBind),
    QueueBindOk,
    QueueUnbind(QueueUnbind),
    QueueUnbindOk,
    QueueDelete(QueueDelete),
    QueueDeleteOk { message_count: u32 },
    BasicPublish(BasicPublish),
    BasicReturn(BasicReturn),
}

impl Method {
    /// Class and method identifiers as they appear on the wire.
    #[must_use]
    pub fn ids(&self) -> (u16, u16) {
        match self {
            Self::ConnectionStart(_) => (CONNECTION, 10),
            Self::ConnectionStartOk(_) => (CONNECTION, 11),
            Self::ConnectionSecure { .. } => (CONNECTION, 20),
            Self::ConnectionSecureOk { .. } => (CONNECTION, 21),
            Self::ConnectionTune(_) => (CONNECTION, 30),
            Self::ConnectionTuneOk(_) => (CONNECTION, 31),
            Self::ConnectionOpen { .. } => (CONNECTION, 40),
            Self::ConnectionOpenOk => (CONNECTION, 41),
            Self::ConnectionClose(_) => (CONNECTION, 50),
            Self::ConnectionCloseOk => (CONNECTION, 51),
            Self::ChannelOpen => (CHANNEL, 10),
            Self::ChannelOpenOk => (CHANNEL, 11),
            Self::ChannelFlow { .. } => (CHANNEL, 20),
            Self::ChannelFlowOk { .. } => (CHANNEL, 21),
            Self::ChannelClose(_) => (CHANNEL, 40),
            Self::ChannelCloseOk => (CHANNEL, 41),
            Self::ExchangeDeclare(_) => (EXCHANGE, 10),
            Self::ExchangeDeclareOk => (EXCHANGE, 11),
            Self::ExchangeDelete(_) => (EXCHANGE, 20),
            Self::ExchangeDeleteOk => (EXCHANGE, 21),
            Self::QueueDeclare(_) => (QUEUE, 10),
            Self::QueueDeclareOk(_) => (QUEUE, 11),
            Self::QueueBind(_) => (QUEUE, 20),
            Self::QueueBindOk => (QUEUE, 21),
            Self::QueueUnbind(_) => (QUEUE, 50),
            Self::QueueUnbindOk => (QUEUE, 51),
            Self::QueueDelete(_) => (QUEUE, 40),
            Self::QueueDeleteOk { .. } => (QUEUE, 41),
            Self::BasicPublish(_) => (BASIC, 40),
            Self::BasicReturn(_) => (BASIC, 50),
        }
    }

    /// Whether a content header and body frames follow this method.
    #[must_use]
    pub fn has_content(&self) -> bool {
        matches!(self, Self::BasicPublish(_) | Self::BasicReturn(_))
    }

    /// Parse a method frame payload.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] if the payload is truncated, carries trailing
    /// bytes, or names a method the broker does not model.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(payload);
        let class_id = r.u16()?;
        let method_id = r.u16()?;
        let method = match (class_id, method_id) {
            (CONNECTION, 10) => Self::ConnectionStart(ConnectionStart {
                version_major: r.u8()?,
                version_minor: r.u8()?,
                server_properties: FieldTable::decode(&mut r)?,
                mechanisms: r.long_str()?,
                locales: r.long_str()?,
            }),
            (CONNECTION, 11) => Self::ConnectionStartOk(ConnectionStartOk {
                client_properties: FieldTable::decode(&mut r)?,
                mechanism: r.short_str()?,
                response: r.long_bytes()?,
                locale: r.short_str()?,
            }),
            (CONNECTION, 20) => Self::ConnectionSecure {
                challenge: r.long_bytes()?,
            },
            (CONNECTION, 21) => Self::ConnectionSecureOk {
                response: r.long_bytes()?,
            },
            (CONNECTION, 30) => Self::ConnectionTune(decode_tune(&mut r)?),
            (CONNECTION, 31) => Self::ConnectionTuneOk(decode_tune(&mut r)?),
            (CONNECTION, 40) => {
                let virtual_host = r.short_str()?;
                let _capabilities = r.short_str()?;
                let _insist = r.u8()?;
                Self::ConnectionOpen { virtual_host }
            }
            (CONNECTION, 41) => {
                let _known_hosts = r.short_str()?;
                Self::ConnectionOpenOk
            }
            (CONNECTION, 50) => Self::ConnectionClose(decode_close(&mut r)?),
            (CONNECTION, 51) => Self::ConnectionCloseOk,
            (CHANNEL, 10) => {
                let _out_of_band = r.short_str()?;
                Self::ChannelOpen
            }
            (CHANNEL, 11) => {
                let _channel_id = r.long_bytes()?;
                Self::ChannelOpenOk
            }
            (CHANNEL, 20) => Self::ChannelFlow {
                active: bit(r.u8()?, 0),
            },
            (CHANNEL, 21) => Self::ChannelFlowOk {
                active: bit(r.u8()?, 0),
            },
            (CHANNEL, 40) => Self::ChannelClose(decode_close(&mut r)?),
            (CHANNEL, 41) => Self::ChannelCloseOk,
            (EXCHANGE, 10) => {
                let _ticket = r.u16()?;
                let exchange = r.short_str()?;
                let kind = r.short_str()?;
                let flags = r.u8()?;
                Self::ExchangeDeclare(ExchangeDeclare {
                    exchange,
                    kind,
                    passive: bit(flags, 0),
                    durable: bit(flags, 1),
                    auto_delete: bit(flags, 2),
                    internal: bit(flags, 3),
                    no_wait: bit(flags, 4),
                    arguments: FieldTable::decode(&mut r)?,
                })
            }
            (EXCHANGE, 11) => Self::ExchangeDeclareOk,
            (EXCHANGE, 20) => {
                let _ticket = r.u16()?;
                let exchange = r.short_str()?;
                let flags = r.u8()?;
                Self::ExchangeDelete(ExchangeDelete {
                    exchange,
                    if_unused: bit(flags, 0),
                    no_wait: bit(flags, 1),
                })
            }
            (EXCHANGE, 21) => Self::ExchangeDeleteOk,
            (QUEUE, 10) => {
                let _ticket = r.u16()?;
                let queue = r.short_str()?;
                let flags = r.u8()?;
                Self::QueueDeclare(QueueDeclare {
                    queue,
                    passive: bit(flags, 0),
                    durable: bit(flags, 1),
                    exclusive: bit(flags, 2),
                    auto_delete: bit(flags, 3),
                    no_wait: bit(flags, 4),
                    arguments: FieldTable::decode(&mut r)?,
                })
            }
            (QUEUE, 11) => Self::QueueDeclareOk(QueueDeclareOk {
                queue: r.short_str()?,
                message_count: r.u32()?,
                consumer_count: r.u32()?,
            }),
            (QUEUE, 20) => {
                let _ticket = r.u16()?;
                Self::QueueBind(QueueBind {
                    queue: r.short_str()?,
                    exchange: r.short_str()?,
                    routing_key: r.short_str()?,
                    no_wait: bit(r.u8()?, 0),
                    arguments: FieldTable::decode(&mut r)?,
                })
            }
            (QUEUE, 21) => Self::QueueBindOk,
            (QUEUE, 50) => {
                let _ticket = r.u16()?;
                Self::QueueUnbind(QueueUnbind {
                    queue: r.short_str()?,
                    exchange: r.short_str()?,
                    routing_key: r.short_str()?,
                    arguments: FieldTable::decode(&mut r)?,
                })
            }
            (QUEUE, 51) => Self::QueueUnbindOk,
            (QUEUE, 40) => {
                let _ticket = r.u16()?;
                let queue = r.short_str()?;
                let flags = r.u8()?;
                Self::QueueDelete(QueueDelete {
                    queue,
                    if_unused: bit(flags, 0),
                    if_empty: bit(flags, 1),
                    no_wait: bit(flags, 2),
                })
            }
            (QUEUE, 41) => Self::QueueDeleteOk {
                message_count: r.u32()?,
            },
            (BASIC, 40) => {
                let _ticket = r.u16()?;
                let exchange = r.short_str()?;
                let routing_key = r.short_str()?;
                let flags = r.u8()?;
                Self::BasicPublish(BasicPublish {
                    exchange,
                    routing_key,
                    mandatory: bit(flags, 0),
                    immediate: bit(flags, 1),
                })
            }
            (BASIC, 50) => Self::BasicReturn(BasicReturn {
                reply_code: r.u16()?,
                reply_text: r.short_str()?,
                exchange: r.short_str()?,
                routing_key: r.short_str()?,
            }),
            _ => {
                return Err(DecodeError::UnknownMethod {
                    class_id,
                    method_id,
                });
            }
        };
        r.finish()?;
        Ok(method)
    }

    /// Serialise the method into a method frame payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let (class_id, method_id) = self.ids();
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u16(class_id);
        buf.put_u16(method_id);
        match self {
            Self::ConnectionStart(m) => {
                buf.put_u8(m.version_major);
                buf.put_u8(m.version_minor);
                m.server_properties.encode(&mut buf);
                put_long_bytes(&mut buf, m.mechanisms.as_bytes());
                put_long_bytes(&mut buf, m.locales.as_bytes());
            }
            Self::ConnectionStartOk(m) => {
                m.client_properties.encode(&mut buf);
                put_short_str(&mut buf, &m.mechanism);
                put_long_bytes(&mut buf, &m.response);
                put_short_str(&mut buf, &m.locale);
            }
            Self::ConnectionSecure { challenge } => put_long_bytes(&mut buf, challenge),
            Self::ConnectionSecureOk { response } => put_long_bytes(&mut buf, response),
            Self::ConnectionTune(t) | Self::ConnectionTuneOk(t) => {
                buf.put_u16(t.channel_max);
                buf.put_u32(t.frame_max);
                buf.put_u16(t.heartbeat);
            }
            Self::ConnectionOpen { virtual_host } => {
                put_short_str(&mut buf, virtual_host);
                put_short_str(&mut buf, "");
                buf.put_u8(0);
            }
            Self::ConnectionOpenOk | Self::ChannelOpen => put_short_str(&mut buf, ""),
            Self::ConnectionClose(c) | Self::ChannelClose(c) => {
                buf.put_u16(c.reply_code);
                put_short_str(&mut buf, &c.reply_text);
                buf.put_u16(c.class_id);
                buf.put_u16(c.method_id);
            }
            Self::ChannelOpenOk => put_long_bytes(&mut buf, &[]),
            Self::ChannelFlow { active } | Self::ChannelFlowOk { active } => {
                buf.put_u8(u8::from(*active));
            }
            Self::ExchangeDeclare(m) => {
                buf.put_u16(0);
                put_short_str(&mut buf, &m.exchange);
                put_short_str(&mut buf, &m.kind);
                buf.put_u8(pack_bits(&[
                    m.passive,
                    m.durable,
                    m.auto_delete,
                    m.internal,
                    m.no_wait,
                ]));
                m.arguments.encode(&mut buf);
            }
            Self::ExchangeDelete(m) => {
                buf.put_u16(0);
                put_short_str(&mut buf, &m.exchange);
                buf.put_u8(pack_bits(&[m.if_unused, m.no_wait]));
            }
            Self::QueueDeclare(m) => {
                buf.put_u16(0);
                put_short_str(&mut buf, &m.queue);
                buf.put_u8(pack_bits(&[
                    m.passive,
                    m.durable,
                    m.exclusive,
                    m.auto_delete,
                    m.no_wait,
                ]));
                m.arguments.encode(&mut buf);
            }
            Self::QueueDeclareOk(m) => {
                put_short_str(&mut buf, &m.queue);
                buf.put_u32(m.message_count);
                buf.put_u32(m.consumer_count);
            }
            Self::QueueBind(m) => {
                buf.put_u16(0);
                put_short_str(&mut buf, &m.queue);
                put_short_str(&mut buf, &m.exchange);
                put_short_str(&mut buf, &m.routing_key);
                buf.put_u8(u8::from(m.no_wait));
                m.arguments.encode(&mut buf);
            }
            Self::QueueUnbind(m) => {
                buf.put_u16(0);
                put_short_str(&mut buf, &m.queue);
                put_short_str(&mut buf, &m.exchange);
                put_short_str(&mut buf, &m.routing_key);
                m.arguments.encode(&mut buf);
            }
            Self::QueueDelete(m) => {
                buf.put_u16(0);
                put_short_str(&mut buf, &m.queue);
                buf.put_u8(pack_bits(&[m.if_unused, m.if_empty, m.no_wait]));
            }
            Self::QueueDeleteOk { message_count } => buf.put_u32(*message_count),
            Self::BasicPublish(m) => {
                buf.put_u16(0);
                put_short_str(&mut buf, &m.exchange);
                put_short_str(&mut buf, &m.routing_key);
                buf.put_u8(pack_bits(&[m.mandatory, m.immediate]));
            }
            Self::BasicReturn(m) => {
                buf.put_u16(m.reply_code);
                put_short_str(&mut buf, &m.reply_text);
                put_short_str(&mut buf, &m.exchange);
                put_short_str(&mut buf, &m.routing_key);
            }
            Self::ConnectionCloseOk
            | Self::ChannelCloseOk
            | Self::ExchangeDeclareOk
            | Self::ExchangeDeleteOk
            | Self::QueueBindOk
            | Self::QueueUnbindOk => {}
        }
        buf.freeze()
    }

    /// Wrap the encoded method in a method frame for `channel`.
    #[must_use]
    pub fn into_frame(self, channel: u16) -> WireFrame {
        WireFrame::new(FrameType::Method, channel, self.encode())
    }
}

fn decode_tune(r: &mut WireReader<'_>) -> Result<Tune, DecodeError> {
    Ok(Tune {
        channel_max: r.u16()?,
        frame_max: r.u32()?,
        heartbeat: r.u16()?,
    })
}

fn decode_close(r: &mut WireReader<'_>) -> Result<Close, DecodeError> {
    Ok(Close {
        reply_code: r.u16()?,
        reply_text: r.short_str()?,
        class_id: r.u16()?,
        method_id: r.u16()?,
    })
}
