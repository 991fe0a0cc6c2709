//! MQTT 3.1.1 packet framing: just the subset C5 needs to speak.
//!
//! Fixed header is one byte (packet-type nibble + flags nibble) followed by
//! a variable-byte remaining-length integer (1-4 bytes, continuation bit in
//! the MSB), then the packet body. Strings on the wire are 2-byte
//! big-endian length-prefixed UTF-8.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub enum Packet {
    Connect { client_id: String, keep_alive: u16 },
    ConnAck,
    Publish {
        topic: String,
        payload: Bytes,
        qos: u8,
        packet_id: Option<u16>,
    },
    PubAck {
        packet_id: u16,
    },
    Subscribe {
        packet_id: u16,
        filters: Vec<(String, u8)>,
    },
    SubAck {
        packet_id: u16,
        codes: Vec<u8>,
    },
    Unsubscribe {
        packet_id: u16,
        filters: Vec<String>,
    },
    UnsubAck {
        packet_id: u16,
    },
    PingReq,
    PingResp,
    Disconnect,
    /// A packet type we don't implement; caller should ignore it.
    Unsupported,
}

#[derive(Debug)]
pub enum ReadError {
    Io(std::io::Error),
    TooLarge,
    Malformed(&'static str),
    Eof,
}

impl From<std::io::Error> for ReadError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Read one packet off `reader`. Returns `ReadError::Eof` on a clean
/// connection close before any bytes of a new packet arrive.
pub async fn read_packet<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Packet, ReadError> {
    let first = match reader.read_u8().await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(ReadError::Eof),
        Err(e) => return Err(e.into()),
    };
    let packet_type = first >> 4;
    let flags = first & 0x0F;

    let remaining_len = read_remaining_length(reader).await?;
    if remaining_len > MAX_PACKET_SIZE {
        return Err(ReadError::TooLarge);
    }

    let mut body = vec![0u8; remaining_len];
    reader.read_exact(&mut body).await?;
    let mut buf = Bytes::from(body);

    match packet_type {
        1 => parse_connect(&mut buf),
        3 => parse_publish(&mut buf, flags),
        4 => parse_puback(&mut buf),
        8 => parse_subscribe(&mut buf),
        10 => parse_unsubscribe(&mut buf),
        12 => Ok(Packet::PingReq),
        14 => Ok(Packet::Disconnect),
        _ => Ok(Packet::Unsupported),
    }
}

async fn read_remaining_length<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<usize, ReadError> {
    let mut multiplier = 1usize;
    let mut value = 0usize;
    for _ in 0..4 {
        let byte = reader.read_u8().await?;
        value += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        multiplier *= 128;
    }
    Err(ReadError::Malformed("remaining length too long"))
}

fn encode_remaining_length(mut len: usize, out: &mut BytesMut) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

fn read_str(buf: &mut Bytes) -> Result<String, ReadError> {
    if buf.remaining() < 2 {
        return Err(ReadError::Malformed("truncated string length"));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(ReadError::Malformed("truncated string body"));
    }
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| ReadError::Malformed("non-utf8 string"))
}

fn write_str(s: &str, out: &mut BytesMut) {
    out.put_u16(s.len() as u16);
    out.put_slice(s.as_bytes());
}

fn parse_connect(buf: &mut Bytes) -> Result<Packet, ReadError> {
    let _protocol_name = read_str(buf)?;
    if buf.remaining() < 4 {
        return Err(ReadError::Malformed("truncated connect header"));
    }
    let _level = buf.get_u8();
    let flags = buf.get_u8();
    let keep_alive = buf.get_u16();
    let client_id = read_str(buf)?;

    let will_flag = flags & 0x04 != 0;
    let username_flag = flags & 0x80 != 0;
    let password_flag = flags & 0x40 != 0;

    if will_flag {
        let _ = read_str(buf);
        let _ = read_str(buf);
    }
    // Credentials are accepted but not enforced: local trust model.
    if username_flag {
        let _ = read_str(buf);
    }
    if password_flag {
        let _ = read_str(buf);
    }

    Ok(Packet::Connect { client_id, keep_alive })
}

fn parse_publish(buf: &mut Bytes, flags: u8) -> Result<Packet, ReadError> {
    let qos = (flags >> 1) & 0x03;
    let topic = read_str(buf)?;
    let packet_id = if qos > 0 {
        if buf.remaining() < 2 {
            return Err(ReadError::Malformed("truncated publish packet id"));
        }
        Some(buf.get_u16())
    } else {
        None
    };
    let payload = buf.split_off(0);
    Ok(Packet::Publish { topic, payload, qos, packet_id })
}

fn parse_puback(buf: &mut Bytes) -> Result<Packet, ReadError> {
    if buf.remaining() < 2 {
        return Err(ReadError::Malformed("truncated puback"));
    }
    Ok(Packet::PubAck { packet_id: buf.get_u16() })
}

fn parse_subscribe(buf: &mut Bytes) -> Result<Packet, ReadError> {
    if buf.remaining() < 2 {
        return Err(ReadError::Malformed("truncated subscribe"));
    }
    let packet_id = buf.get_u16();
    let mut filters = Vec::new();
    while buf.remaining() > 0 {
        let filter = read_str(buf)?;
        if buf.remaining() < 1 {
            return Err(ReadError::Malformed("truncated subscribe qos"));
        }
        let qos = buf.get_u8() & 0x03;
        filters.push((filter, qos));
    }
    Ok(Packet::Subscribe { packet_id, filters })
}

fn parse_unsubscribe(buf: &mut Bytes) -> Result<Packet, ReadError> {
    if buf.remaining() < 2 {
        return Err(ReadError::Malformed("truncated unsubscribe"));
    }
    let packet_id = buf.get_u16();
    let mut filters = Vec::new();
    while buf.remaining() > 0 {
        filters.push(read_str(buf)?);
    }
    Ok(Packet::Unsubscribe { packet_id, filters })
}

fn frame(packet_type: u8, flags: u8, body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(body.len() + 5);
    out.put_u8((packet_type << 4) | flags);
    encode_remaining_length(body.len(), &mut out);
    out.put_slice(body);
    out.freeze()
}

pub fn encode_connack() -> Bytes {
    frame(2, 0, &[0x00, 0x00])
}

pub fn encode_publish(topic: &str, payload: &[u8], qos: u8, packet_id: Option<u16>) -> Bytes {
    let mut body = BytesMut::new();
    write_str(topic, &mut body);
    if qos > 0 {
        body.put_u16(packet_id.unwrap_or(0));
    }
    body.put_slice(payload);
    frame(3, qos << 1, &body)
}

pub fn encode_puback(packet_id: u16) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u16(packet_id);
    frame(4, 0, &body)
}

pub fn encode_suback(packet_id: u16, codes: &[u8]) -> Bytes {
    let mut body = BytesMut::with_capacity(2 + codes.len());
    body.put_u16(packet_id);
    body.put_slice(codes);
    frame(9, 0, &body)
}

pub fn encode_unsuback(packet_id: u16) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u16(packet_id);
    frame(11, 0, &body)
}

pub fn encode_pingresp() -> Bytes {
    frame(13, 0, &[])
}

/// Standard MQTT 3.1.1 topic-filter matching: `+` matches exactly one
/// level, `#` matches zero or more trailing levels and must be the final
/// segment.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if filter == topic {
        return true;
    }

    let filter_parts: Vec<&str> = filter.split('/').collect();
    let topic_parts: Vec<&str> = topic.split('/').collect();

    let mut fi = 0;
    let mut ti = 0;
    while fi < filter_parts.len() {
        match filter_parts[fi] {
            "#" => return fi == filter_parts.len() - 1,
            "+" => {
                if ti >= topic_parts.len() {
                    return false;
                }
                fi += 1;
                ti += 1;
            }
            literal => {
                if ti >= topic_parts.len() || topic_parts[ti] != literal {
                    return false;
                }
                fi += 1;
                ti += 1;
            }
        }
    }
    ti == topic_parts.len()
}

pub async fn write_packet<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plus_matches_single_level() {
        assert!(topic_matches("device/+/report", "device/01S/report"));
        assert!(!topic_matches("device/+/report", "device/01S/sub/report"));
    }

    #[test]
    fn hash_matches_trailing_levels() {
        assert!(topic_matches("device/01S/#", "device/01S/report"));
        assert!(topic_matches("device/01S/#", "device/01S/report/extra"));
        assert!(topic_matches("device/01S/#", "device/01S"));
    }

    #[test]
    fn hash_must_be_final_segment_or_literal_mismatch() {
        assert!(!topic_matches("device/#/report", "device/01S/report"));
    }

    #[test]
    fn literal_equality_fast_path() {
        assert!(topic_matches("device/01S/report", "device/01S/report"));
        assert!(!topic_matches("device/01S/report", "device/01S/reports"));
    }

    #[tokio::test]
    async fn connect_round_trips_client_id_and_keepalive() {
        let mut body = BytesMut::new();
        write_str("MQTT", &mut body);
        body.put_u8(4); // level
        body.put_u8(0x02); // clean session, no will/user/pass
        body.put_u16(60);
        write_str("agent-1", &mut body);
        let framed = frame(1, 0, &body);

        let mut cursor = std::io::Cursor::new(framed.to_vec());
        let packet = read_packet(&mut cursor).await.unwrap();
        match packet {
            Packet::Connect { client_id, keep_alive } => {
                assert_eq!(client_id, "agent-1");
                assert_eq!(keep_alive, 60);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_qos1_round_trips_packet_id() {
        let encoded = encode_publish("device/01S/report", b"hello", 1, Some(42));
        let mut cursor = std::io::Cursor::new(encoded.to_vec());
        let packet = read_packet(&mut cursor).await.unwrap();
        match packet {
            Packet::Publish { topic, payload, qos, packet_id } => {
                assert_eq!(topic, "device/01S/report");
                assert_eq!(&payload[..], b"hello");
                assert_eq!(qos, 1);
                assert_eq!(packet_id, Some(42));
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribe_round_trips_filters() {
        let mut body = BytesMut::new();
        body.put_u16(7);
        write_str("device/+/report", &mut body);
        body.put_u8(0);
        let framed = frame(8, 2, &body);

        let mut cursor = std::io::Cursor::new(framed.to_vec());
        let packet = read_packet(&mut cursor).await.unwrap();
        match packet {
            Packet::Subscribe { packet_id, filters } => {
                assert_eq!(packet_id, 7);
                assert_eq!(filters, vec![("device/+/report".to_string(), 0)]);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversize_packet_is_rejected() {
        let mut out = BytesMut::new();
        out.put_u8(3 << 4);
        encode_remaining_length(MAX_PACKET_SIZE + 1, &mut out);
        let mut cursor = std::io::Cursor::new(out.to_vec());
        assert!(matches!(read_packet(&mut cursor).await, Err(ReadError::TooLarge)));
    }
}
