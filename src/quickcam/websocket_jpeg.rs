//! P1/A1-family variant: the printer's own framed-JPEG service on TCP port
//! 6000. Not actual WebSocket despite the name carried over from the
//! vendor's own client code — it's a fixed 80-byte auth frame, then an
//! unbounded sequence of 16-byte-length-prefixed JPEG frames, all inside a
//! TLS tunnel that uses the same trust-on-first-use posture as the MQTT
//! session.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::insecure_tls;

use super::QuickCam;

const PORT: u16 = 6000;
const READ_TIMEOUT: Duration = Duration::from_secs(10);
const JPEG_SOI: [u8; 4] = [0xFF, 0xD8, 0xFF, 0xE0];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub async fn stream(cam: &Arc<QuickCam>) -> Result<(), BoxError> {
    let tcp = tokio::time::timeout(READ_TIMEOUT, TcpStream::connect((cam.ip.as_str(), PORT)))
        .await
        .map_err(|_| "connect timed out")??;

    let connector = TlsConnector::from(Arc::new(insecure_tls::client_config()));
    let server_name = ServerName::try_from(cam.ip.clone())
        .map_err(|_| "invalid printer address for TLS SNI")?;
    let mut tls = tokio::time::timeout(READ_TIMEOUT, connector.connect(server_name, tcp))
        .await
        .map_err(|_| "tls handshake timed out")??;

    tls.write_all(&auth_frame(&cam.access_code)).await?;

    loop {
        if cam.should_stop().await {
            return Ok(());
        }

        let mut header = [0u8; 16];
        tokio::time::timeout(READ_TIMEOUT, tls.read_exact(&mut header))
            .await
            .map_err(|_| "read timed out waiting for frame header")??;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len == 0 || len > 16 * 1024 * 1024 {
            return Err(format!("implausible frame length {len}").into());
        }

        let mut body = BytesMut::zeroed(len);
        tokio::time::timeout(READ_TIMEOUT, tls.read_exact(&mut body))
            .await
            .map_err(|_| "read timed out waiting for frame body")??;

        if !is_valid_jpeg(&body) {
            debug!(serial = %cam.serial, "quickcam frame failed SOI/EOI check, reconnecting");
            return Err("malformed jpeg frame".into());
        }

        cam.on_frame(body.freeze());
    }
}

fn is_valid_jpeg(body: &[u8]) -> bool {
    body.len() >= JPEG_SOI.len() + JPEG_EOI.len()
        && body[..JPEG_SOI.len()] == JPEG_SOI
        && body[body.len() - JPEG_EOI.len()..] == JPEG_EOI
}

/// 80-byte auth frame: a fixed header, then the username and access code
/// each zero-padded to 32 bytes.
fn auth_frame(access_code: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(80);
    buf.extend_from_slice(&0x40u32.to_le_bytes());
    buf.extend_from_slice(&0x3000u32.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    push_padded(&mut buf, b"bblp", 32);
    push_padded(&mut buf, access_code.as_bytes(), 32);
    buf.freeze()
}

fn push_padded(buf: &mut BytesMut, value: &[u8], width: usize) {
    let take = value.len().min(width);
    buf.extend_from_slice(&value[..take]);
    buf.resize(buf.len() + (width - take), 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_frame_is_eighty_bytes_and_pads_access_code() {
        let frame = auth_frame("1234");
        assert_eq!(frame.len(), 80);
        assert_eq!(&frame[16..20], b"bblp");
        assert_eq!(&frame[48..52], b"1234");
        assert_eq!(frame[52], 0);
    }

    #[test]
    fn rejects_frame_missing_jpeg_markers() {
        assert!(!is_valid_jpeg(b"not a jpeg"));
        let mut good = JPEG_SOI.to_vec();
        good.extend_from_slice(b"...");
        good.extend_from_slice(&JPEG_EOI);
        assert!(is_valid_jpeg(&good));
    }
}
