//! Service channel (C5): a per-module client connection to the module's
//! control socket, used to scrape counters.
//!
//! spec.md §4.4 describes a blocking request/reply client over a
//! non-blocking socket with an explicit `EAGAIN` retry loop. The async
//! equivalent used here (per SPEC_FULL.md §4.4) is a `tokio::net::UnixStream`
//! with `tokio::time::timeout` standing in for each bounded retry attempt;
//! the observable policy — 3 transient timeouts, 25ms apart, then fail —
//! is unchanged.
//!
//! The wire header is sent as five explicit bytes (`command: u8` followed
//! by `data_size: u32` in native-endian order) rather than relying on a
//! Rust struct's in-memory layout, which is not a wire format. This keeps
//! "host-endian" (the one part of the original layout spec.md §6
//! deliberately preserves) without inheriting undefined struct padding.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::error::ServiceError;

pub const CMD_GET: u8 = 10;
#[allow(dead_code)] // reserved by the wire protocol, unused by this core (spec.md §4.4)
pub const CMD_SET: u8 = 11;
pub const CMD_OK: u8 = 12;

const RETRY_ATTEMPTS: usize = 3;
const RETRY_SLEEP: Duration = Duration::from_millis(25);
const IO_TIMEOUT: Duration = Duration::from_millis(200);

const HEADER_LEN: usize = 5;

/// Socket path for a module's service interface (spec.md §6).
pub fn socket_path(pid: u32) -> String {
    format!("/tmp/trap-localhost-service_{pid}.sock")
}

fn encode_header(command: u8, data_size: u32) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[0] = command;
    buf[1..5].copy_from_slice(&data_size.to_ne_bytes());
    buf
}

fn decode_header(buf: &[u8; HEADER_LEN]) -> (u8, u32) {
    let command = buf[0];
    let data_size = u32::from_ne_bytes([buf[1], buf[2], buf[3], buf[4]]);
    (command, data_size)
}

/// An open connection to one module's service socket.
pub struct ServiceChannel {
    stream: UnixStream,
}

impl ServiceChannel {
    /// Connect to the module's service socket. Counts as one of the
    /// bounded per-boot connection attempts in the caller (spec.md §4.4).
    pub async fn connect(pid: u32) -> Result<Self, ServiceError> {
        let path = socket_path(pid);
        let stream = UnixStream::connect(&path)
            .await
            .map_err(ServiceError::Connect)?;
        Ok(Self { stream })
    }

    /// Send `GET` and return the raw JSON payload bytes.
    pub async fn get_counters(&mut self) -> Result<Vec<u8>, ServiceError> {
        let header = encode_header(CMD_GET, 0);
        retry(|| self.stream.write_all(&header)).await?;

        let mut reply_header = [0u8; HEADER_LEN];
        retry(|| self.stream.read_exact(&mut reply_header)).await?;
        let (command, data_size) = decode_header(&reply_header);
        if command != CMD_OK {
            return Err(ServiceError::Dropped(format!(
                "unexpected reply command {command}"
            )));
        }

        let mut payload = vec![0u8; data_size as usize];
        if data_size > 0 {
            retry(|| self.stream.read_exact(&mut payload)).await?;
        }
        Ok(payload)
    }
}

/// Run one I/O operation with up to [`RETRY_ATTEMPTS`] bounded attempts on
/// transient timeout, sleeping [`RETRY_SLEEP`] between attempts. A genuine
/// I/O error (not a timeout) drops the connection immediately rather than
/// retrying, since it indicates the peer is gone, not merely slow.
async fn retry<'a, F, Fut>(mut op: F) -> Result<(), ServiceError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::io::Result<()>> + 'a,
{
    for attempt in 0..RETRY_ATTEMPTS {
        match tokio::time::timeout(IO_TIMEOUT, op()).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => return Err(ServiceError::Dropped(e.to_string())),
            Err(_elapsed) => {
                if attempt + 1 < RETRY_ATTEMPTS {
                    tokio::time::sleep(RETRY_SLEEP).await;
                }
            }
        }
    }
    Err(ServiceError::Transient)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let encoded = encode_header(CMD_GET, 1234);
        let (cmd, size) = decode_header(&encoded);
        assert_eq!(cmd, CMD_GET);
        assert_eq!(size, 1234);
    }

    #[tokio::test]
    async fn get_counters_reads_well_formed_reply() {
        let (mut server, client) = UnixStream::pair().unwrap();
        let mut channel = ServiceChannel { stream: client };

        let payload = br#"{"in":[],"out":[]}"#;
        tokio::spawn(async move {
            let mut req = [0u8; HEADER_LEN];
            server.read_exact(&mut req).await.unwrap();
            let (cmd, _) = decode_header(&req);
            assert_eq!(cmd, CMD_GET);
            let reply_header = encode_header(CMD_OK, payload.len() as u32);
            server.write_all(&reply_header).await.unwrap();
            server.write_all(payload).await.unwrap();
        });

        let got = channel.get_counters().await.unwrap();
        assert_eq!(got, payload);
    }
}
