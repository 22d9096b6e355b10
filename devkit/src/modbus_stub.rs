/*!
Modbus TCP device stub.

Serves read-holding-registers (0x03) from an in-memory register bank.
Unset registers read as zero. A stall switch makes the stub accept
connections but never answer, for timeout testing.
*/

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub struct ModbusStub {
    addr: SocketAddr,
    registers: Arc<Mutex<HashMap<u16, u16>>>,
    stalled: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

impl ModbusStub {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let registers: Arc<Mutex<HashMap<u16, u16>>> = Arc::new(Mutex::new(HashMap::new()));
        let stalled = Arc::new(AtomicBool::new(false));

        let bank = registers.clone();
        let stall_flag = stalled.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let bank = bank.clone();
                let stall_flag = stall_flag.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(stream, bank, stall_flag).await;
                });
            }
        });

        tracing::debug!("modbus stub listening on {}", addr);
        Ok(Self {
            addr,
            registers,
            stalled,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.registers.lock().insert(address, value);
    }

    /// Store an f32 across two registers, high word first.
    pub fn set_f32(&self, address: u16, value: f32) {
        let bits = value.to_bits();
        let mut bank = self.registers.lock();
        bank.insert(address, (bits >> 16) as u16);
        bank.insert(address + 1, bits as u16);
    }

    /// Store a u32 across two registers, high word first.
    pub fn set_u32(&self, address: u16, value: u32) {
        let mut bank = self.registers.lock();
        bank.insert(address, (value >> 16) as u16);
        bank.insert(address + 1, value as u16);
    }

    /// When stalled, connections are accepted but requests never answered.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::Relaxed);
    }
}

impl Drop for ModbusStub {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    bank: Arc<Mutex<HashMap<u16, u16>>>,
    stalled: Arc<AtomicBool>,
) -> std::io::Result<()> {
    loop {
        // Read-holding-registers requests are always 12 bytes.
        let mut request = [0u8; 12];
        stream.read_exact(&mut request).await?;

        if stalled.load(Ordering::Relaxed) {
            // Hold the socket open without answering.
            std::future::pending::<()>().await;
        }

        let txn = [request[0], request[1]];
        let unit = request[6];
        let function = request[7];
        let address = u16::from_be_bytes([request[8], request[9]]);
        let count = u16::from_be_bytes([request[10], request[11]]);

        let response = if function != 0x03 || count == 0 || count > 125 {
            exception_frame(txn, unit, function, 0x01)
        } else {
            let bank = bank.lock();
            let words: Vec<u16> = (0..count)
                .map(|i| bank.get(&(address + i)).copied().unwrap_or(0))
                .collect();
            drop(bank);
            response_frame(txn, unit, &words)
        };

        stream.write_all(&response).await?;
    }
}

fn response_frame(txn: [u8; 2], unit: u8, words: &[u16]) -> Vec<u8> {
    let byte_count = (words.len() * 2) as u8;
    let length = (3 + words.len() * 2) as u16;
    let mut frame = Vec::with_capacity(9 + words.len() * 2);
    frame.extend_from_slice(&txn);
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(unit);
    frame.push(0x03);
    frame.push(byte_count);
    for word in words {
        frame.extend_from_slice(&word.to_be_bytes());
    }
    frame
}

fn exception_frame(txn: [u8; 2], unit: u8, function: u8, code: u8) -> Vec<u8> {
    let mut frame = Vec::with_capacity(9);
    frame.extend_from_slice(&txn);
    frame.extend_from_slice(&[0, 0, 0, 3]);
    frame.push(unit);
    frame.push(function | 0x80);
    frame.push(code);
    frame
}
