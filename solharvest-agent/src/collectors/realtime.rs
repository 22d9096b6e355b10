//! Local Modbus TCP collector
//!
//! Reads a bounded set of holding registers per cycle and converts the
//! raw words to engineering units per the descriptor's declared format.
//! The connection is reopened each cycle: a failed poll never corrupts
//! the next one. Retries are bounded per call with a short delay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::collectors::CollectError;
use crate::config::{EndpointDescriptor, MeasurementSpec, ModbusSourceConfig, RegisterFormat};
use crate::model::{PayloadBody, RawPayload, SourceKind};

const MODBUS_PROTOCOL_ID: u16 = 0;
const FN_READ_HOLDING_REGISTERS: u8 = 0x03;

pub struct RealtimeCollector {
    cfg: ModbusSourceConfig,
    transaction_id: AtomicU16,
}

impl RealtimeCollector {
    pub fn new(cfg: ModbusSourceConfig) -> Self {
        Self {
            cfg,
            transaction_id: AtomicU16::new(1),
        }
    }

    pub async fn collect(&self, descriptor: &EndpointDescriptor) -> RawPayload {
        let specs: Vec<&MeasurementSpec> = descriptor
            .enabled_measurements()
            .filter(|m| m.register.is_some())
            .collect();
        if specs.is_empty() {
            return RawPayload::failed(
                SourceKind::Modbus,
                &descriptor.id,
                "no register measurements configured",
            );
        }

        let mut last_error = String::new();
        for attempt in 0..=self.cfg.retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(self.cfg.retry_delay_ms)).await;
            }
            match self.read_cycle(descriptor, &specs).await {
                Ok(registers) => {
                    return RawPayload::fetched(
                        SourceKind::Modbus,
                        &descriptor.id,
                        PayloadBody::Registers(registers),
                    );
                }
                Err(e) => {
                    warn!(
                        "modbus cycle failed for {} (attempt {}/{}): {}",
                        descriptor.id,
                        attempt + 1,
                        self.cfg.retries + 1,
                        e
                    );
                    last_error = e.to_string();
                }
            }
        }

        RawPayload::failed(SourceKind::Modbus, &descriptor.id, last_error)
    }

    async fn read_cycle(
        &self,
        descriptor: &EndpointDescriptor,
        specs: &[&MeasurementSpec],
    ) -> Result<HashMap<String, f64>, CollectError> {
        let addr = format!("{}:{}", self.cfg.host, self.cfg.port);
        let connect_timeout = Duration::from_millis(self.cfg.connect_timeout_ms);
        let read_timeout = Duration::from_millis(self.cfg.read_timeout_ms);

        let mut stream = timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| CollectError::Timeout(connect_timeout))?
            .map_err(|e| CollectError::Modbus(format!("connect {addr}: {e}")))?;

        let unit_id = descriptor.unit_id.unwrap_or(1);
        let mut registers = HashMap::new();

        for spec in specs {
            let register = spec.register.unwrap_or_default();
            let format = spec.register_format.unwrap_or(RegisterFormat::U16);
            let words = self
                .read_registers(&mut stream, unit_id, register, format.register_count(), read_timeout)
                .await?;
            let raw = decode_registers(format, &words)?;
            let value = raw * spec.scale.unwrap_or(1.0);
            debug!("{}.{} = {} ({:?})", descriptor.id, spec.name, value, format);
            registers.insert(spec.name.clone(), value);
        }

        Ok(registers)
    }

    async fn read_registers(
        &self,
        stream: &mut TcpStream,
        unit_id: u8,
        address: u16,
        count: u16,
        read_timeout: Duration,
    ) -> Result<Vec<u16>, CollectError> {
        let txn = self.transaction_id.fetch_add(1, Ordering::Relaxed);
        let request = build_read_request(txn, unit_id, address, count);

        timeout(read_timeout, stream.write_all(&request))
            .await
            .map_err(|_| CollectError::Timeout(read_timeout))?
            .map_err(|e| CollectError::Modbus(format!("write: {e}")))?;

        // MBAP header: txn(2) proto(2) length(2) unit(1); length counts the
        // unit byte plus the PDU.
        let mut header = [0u8; 7];
        timeout(read_timeout, stream.read_exact(&mut header))
            .await
            .map_err(|_| CollectError::Timeout(read_timeout))?
            .map_err(|e| CollectError::Modbus(format!("read header: {e}")))?;

        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        if length < 2 || length > 256 {
            return Err(CollectError::Modbus(format!("bad frame length {length}")));
        }
        let mut pdu = vec![0u8; length - 1];
        timeout(read_timeout, stream.read_exact(&mut pdu))
            .await
            .map_err(|_| CollectError::Timeout(read_timeout))?
            .map_err(|e| CollectError::Modbus(format!("read pdu: {e}")))?;

        parse_response_pdu(&pdu, count)
    }
}

/// Read-holding-registers request frame (MBAP + PDU).
fn build_read_request(txn: u16, unit_id: u8, address: u16, count: u16) -> [u8; 12] {
    let txn = txn.to_be_bytes();
    let proto = MODBUS_PROTOCOL_ID.to_be_bytes();
    let addr = address.to_be_bytes();
    let cnt = count.to_be_bytes();
    [
        txn[0], txn[1], proto[0], proto[1], 0, 6, unit_id, FN_READ_HOLDING_REGISTERS, addr[0],
        addr[1], cnt[0], cnt[1],
    ]
}

/// PDU after the MBAP header: function code, byte count, register words.
fn parse_response_pdu(pdu: &[u8], expected_count: u16) -> Result<Vec<u16>, CollectError> {
    if pdu.is_empty() {
        return Err(CollectError::Modbus("empty response".to_string()));
    }
    let function = pdu[0];
    if function == FN_READ_HOLDING_REGISTERS | 0x80 {
        let code = pdu.get(1).copied().unwrap_or(0);
        return Err(CollectError::Modbus(format!("exception code {code}")));
    }
    if function != FN_READ_HOLDING_REGISTERS {
        return Err(CollectError::Modbus(format!("unexpected function {function}")));
    }
    if pdu.len() < 2 {
        return Err(CollectError::Modbus("truncated response".to_string()));
    }

    let byte_count = pdu[1] as usize;
    let data = &pdu[2..];
    if data.len() < byte_count || byte_count != expected_count as usize * 2 {
        return Err(CollectError::Modbus(format!(
            "short response: {} data bytes, expected {}",
            data.len(),
            expected_count * 2
        )));
    }

    Ok(data[..byte_count]
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}

/// Convert raw register words to a number per the declared format.
/// 32-bit formats use big-endian word order (high word first).
fn decode_registers(format: RegisterFormat, words: &[u16]) -> Result<f64, CollectError> {
    let need = format.register_count() as usize;
    if words.len() < need {
        return Err(CollectError::Modbus(format!(
            "{} registers for {:?}, need {}",
            words.len(),
            format,
            need
        )));
    }
    Ok(match format {
        RegisterFormat::U16 => words[0] as f64,
        RegisterFormat::S16 => words[0] as i16 as f64,
        RegisterFormat::U32 => (((words[0] as u32) << 16) | words[1] as u32) as f64,
        RegisterFormat::F32 => {
            f32::from_bits(((words[0] as u32) << 16) | words[1] as u32) as f64
        }
    })
}
