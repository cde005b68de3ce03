use devflow_sdk::{DriverError, DriverResult};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, trace};

const BAUD_RATE: u32 = 19_200;
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

/// VE.Direct HEX commands.
const CMD_PING: u8 = 0x01;
const CMD_GET: u8 = 0x07;

/// Response markers.
const RSP_PING: u8 = 0x05;
const RSP_GET: u8 = 0x07;

/// Well-known register holding the product id.
pub const REG_PRODUCT_ID: u16 = 0x0100;

/// The checksum closes each frame so that command nibble plus all payload
/// bytes sum to 0x55 modulo 256.
fn checksum(cmd: u8, data: &[u8]) -> u8 {
    data.iter()
        .fold(0x55u8.wrapping_sub(cmd), |acc, b| acc.wrapping_sub(*b))
}

fn encode_frame(cmd: u8, data: &[u8]) -> String {
    let mut frame = format!(":{:X}", cmd & 0x0F);
    for b in data {
        frame.push_str(&format!("{b:02X}"));
    }
    frame.push_str(&format!("{:02X}\n", checksum(cmd, data)));
    frame
}

/// Parse a `:<cmd><payload><check>\n` line (without the colon and newline)
/// into command nibble and payload bytes, verifying the checksum.
fn decode_frame(line: &str) -> DriverResult<(u8, Vec<u8>)> {
    if line.is_empty() || line.len() % 2 != 1 {
        return Err(DriverError::CodecError(format!(
            "invalid frame length: '{line}'"
        )));
    }
    let cmd = u8::from_str_radix(&line[..1], 16)
        .map_err(|_| DriverError::CodecError(format!("invalid command nibble: '{line}'")))?;
    let mut bytes = Vec::with_capacity(line.len() / 2);
    for i in (1..line.len()).step_by(2) {
        let b = u8::from_str_radix(&line[i..i + 2], 16)
            .map_err(|_| DriverError::CodecError(format!("invalid hex payload: '{line}'")))?;
        bytes.push(b);
    }
    let check = bytes.pop().ok_or_else(|| {
        DriverError::CodecError(format!("missing checksum: '{line}'"))
    })?;
    if check != checksum(cmd, &bytes) {
        return Err(DriverError::CodecError(format!("checksum mismatch: '{line}'")));
    }
    Ok((cmd, bytes))
}

/// VE.Direct HEX session over a serial port.
///
/// The device intersperses asynchronous text-mode frames with HEX
/// responses; everything not starting with a colon is discarded.
pub struct VeDirect {
    stream: SerialStream,
    buffer: Vec<u8>,
    log_com_debug: bool,
}

impl VeDirect {
    pub async fn open(path: &str, log_com_debug: bool) -> DriverResult<Self> {
        let stream = tokio_serial::new(path, BAUD_RATE)
            .open_native_async()
            .map_err(|e| {
                DriverError::ConfigurationError(format!("cannot open serial port {path}: {e}"))
            })?;
        Ok(Self {
            stream,
            buffer: Vec::new(),
            log_com_debug,
        })
    }

    /// Discard any buffered asynchronous data before a command cycle.
    pub fn recv_flush(&mut self) {
        self.buffer.clear();
    }

    async fn command(&mut self, cmd: u8, data: &[u8], expect: u8) -> DriverResult<Vec<u8>> {
        let frame = encode_frame(cmd, data);
        if self.log_com_debug {
            trace!(frame = %frame.trim_end(), "ve.direct send");
        }
        self.stream
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| DriverError::SessionError(format!("serial write failed: {e}")))?;

        let deadline = tokio::time::Instant::now() + RESPONSE_TIMEOUT;
        loop {
            if let Some(line) = self.take_hex_line() {
                if self.log_com_debug {
                    trace!(frame = %line, "ve.direct recv");
                }
                let (rsp, payload) = match decode_frame(&line) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        debug!(error = %e, "skipping malformed frame");
                        continue;
                    }
                };
                if rsp == expect {
                    return Ok(payload);
                }
                // asynchronous frame for another command, keep waiting
                continue;
            }

            let mut chunk = [0u8; 64];
            let read = tokio::time::timeout_at(deadline, self.stream.read(&mut chunk)).await;
            match read {
                Ok(Ok(0)) => {
                    return Err(DriverError::SessionError("serial port closed".to_string()))
                }
                Ok(Ok(n)) => self.buffer.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => {
                    return Err(DriverError::SessionError(format!("serial read failed: {e}")))
                }
                Err(_) => return Err(DriverError::Timeout(RESPONSE_TIMEOUT)),
            }
        }
    }

    /// Extract the next complete `:<...>\n` line from the receive buffer.
    fn take_hex_line(&mut self) -> Option<String> {
        let start = self.buffer.iter().position(|b| *b == b':')?;
        let end = self.buffer[start..].iter().position(|b| *b == b'\n')? + start;
        let line: String = self.buffer[start + 1..end]
            .iter()
            .map(|b| *b as char)
            .collect();
        self.buffer.drain(..=end);
        Some(line.trim_end_matches('\r').to_string())
    }

    pub async fn ping(&mut self) -> DriverResult<()> {
        self.command(CMD_PING, &[], RSP_PING).await.map(|_| ())
    }

    async fn get(&mut self, address: u16) -> DriverResult<Vec<u8>> {
        let request = [address as u8, (address >> 8) as u8, 0x00];
        let payload = self.command(CMD_GET, &request, RSP_GET).await?;
        // payload: address echo (2 bytes), flags (1 byte), value
        if payload.len() < 3 {
            return Err(DriverError::CodecError(format!(
                "short get response for 0x{address:04X}"
            )));
        }
        let echo = u16::from(payload[0]) | (u16::from(payload[1]) << 8);
        if echo != address {
            return Err(DriverError::CodecError(format!(
                "get response for 0x{echo:04X}, expected 0x{address:04X}"
            )));
        }
        if payload[2] != 0 {
            return Err(DriverError::ExecutionError(format!(
                "register 0x{address:04X} flagged 0x{:02X}",
                payload[2]
            )));
        }
        Ok(payload[3..].to_vec())
    }

    pub async fn get_uint(&mut self, address: u16) -> DriverResult<u64> {
        let value = self.get(address).await?;
        Ok(value
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    pub async fn get_int(&mut self, address: u16) -> DriverResult<i64> {
        let value = self.get(address).await?;
        let unsigned = value
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        let bits = value.len() * 8;
        if bits == 0 || bits >= 64 {
            return Ok(unsigned as i64);
        }
        // sign-extend little-endian value
        let sign = 1u64 << (bits - 1);
        Ok(if unsigned & sign != 0 {
            (unsigned | !((1u64 << bits) - 1)) as i64
        } else {
            unsigned as i64
        })
    }

    pub async fn get_string(&mut self, address: u16) -> DriverResult<String> {
        let value = self.get(address).await?;
        let end = value.iter().position(|b| *b == 0).unwrap_or(value.len());
        Ok(String::from_utf8_lossy(&value[..end]).trim().to_string())
    }

    pub async fn product_id(&mut self) -> DriverResult<u16> {
        let value = self.get_uint(REG_PRODUCT_ID).await?;
        Ok(value as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_carry_a_balancing_checksum() {
        let frame = encode_frame(CMD_PING, &[]);
        assert_eq!(frame, ":154\n");

        let line = frame.trim_start_matches(':').trim_end();
        let (cmd, payload) = decode_frame(line).unwrap();
        assert_eq!(cmd, CMD_PING);
        assert!(payload.is_empty());
    }

    #[test]
    fn get_frames_round_trip() {
        let frame = encode_frame(CMD_GET, &[0x8D, 0xED, 0x00]);
        let line = frame.trim_start_matches(':').trim_end();
        let (cmd, payload) = decode_frame(line).unwrap();
        assert_eq!(cmd, CMD_GET);
        assert_eq!(payload, vec![0x8D, 0xED, 0x00]);
    }

    #[test]
    fn corrupted_frames_are_rejected() {
        assert!(decode_frame("7FF").is_err());
        assert!(decode_frame("").is_err());
        assert!(decode_frame("ZZZZZ").is_err());
    }
}
