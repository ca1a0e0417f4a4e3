//! Modbus/TCP PLC client
//!
//! Protocol:
//! - Frame: [TxnId u16][Proto u16 = 0][Len u16][Unit u8][PDU]
//! - Len counts the unit byte plus the PDU
//! - Write single coil: [0x05][Addr u16][0xFF00 | 0x0000], response echoes the request
//! - Read coils: [0x01][Addr u16][Qty u16] -> [0x01][ByteCount][Bits...]
//! - Exception: [Fn | 0x80][Code]
//!
//! All fields are big-endian. The session is synchronous: one request in
//! flight at a time, guarded by a mutex. An I/O error drops the socket and
//! the next request reconnects.

use super::PlcClient;
use crate::infra::config::ModbusConfig;
use anyhow::{anyhow, bail, Context};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Log connection failure (cold path)
#[cold]
fn log_connect_failed(addr: &SocketAddr, e: &std::io::Error) {
    error!(addr = %addr, error = %e, "plc_connect_failed");
}

/// Log request failure (cold path)
#[cold]
fn log_io_error(e: &anyhow::Error) {
    error!(error = %e, "plc_io_error");
}

const MBAP_LEN: usize = 7;
const MAX_PDU_LEN: usize = 253;

const FN_READ_COILS: u8 = 0x01;
const FN_WRITE_SINGLE_COIL: u8 = 0x05;
const EXCEPTION_BIT: u8 = 0x80;

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

/// Build a request frame (MBAP header + PDU)
fn build_frame(txn_id: u16, unit_id: u8, pdu: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(MBAP_LEN + pdu.len());
    buf.put_u16(txn_id);
    buf.put_u16(0);
    buf.put_u16((pdu.len() + 1) as u16);
    buf.put_u8(unit_id);
    buf.put_slice(pdu);
    buf
}

/// Parsed MBAP header
#[derive(Debug, Clone, Copy, PartialEq)]
struct Header {
    txn_id: u16,
    protocol: u16,
    len: u16,
    unit_id: u8,
}

impl Header {
    fn parse(mut buf: &[u8]) -> Option<Header> {
        if buf.len() < MBAP_LEN {
            return None;
        }
        Some(Header {
            txn_id: buf.get_u16(),
            protocol: buf.get_u16(),
            len: buf.get_u16(),
            unit_id: buf.get_u8(),
        })
    }

    fn pdu_len(&self) -> anyhow::Result<usize> {
        let len = self.len as usize;
        if len < 2 || len - 1 > MAX_PDU_LEN {
            bail!("invalid MBAP length {len}");
        }
        Ok(len - 1)
    }
}

fn write_coil_pdu(addr: u16, on: bool) -> [u8; 5] {
    let value = if on { COIL_ON } else { COIL_OFF };
    let [a_hi, a_lo] = addr.to_be_bytes();
    let [v_hi, v_lo] = value.to_be_bytes();
    [FN_WRITE_SINGLE_COIL, a_hi, a_lo, v_hi, v_lo]
}

fn read_coils_pdu(addr: u16, qty: u16) -> [u8; 5] {
    let [a_hi, a_lo] = addr.to_be_bytes();
    let [q_hi, q_lo] = qty.to_be_bytes();
    [FN_READ_COILS, a_hi, a_lo, q_hi, q_lo]
}

/// Validate the response function code, surfacing exception responses
fn check_function(function: u8, pdu: &[u8]) -> anyhow::Result<()> {
    match pdu.first() {
        Some(&f) if f == function => Ok(()),
        Some(&f) if f == function | EXCEPTION_BIT => {
            let code = pdu.get(1).copied().unwrap_or(0);
            bail!("modbus exception 0x{code:02X} for function 0x{function:02X}")
        }
        Some(&f) => bail!("unexpected function 0x{f:02X}, expected 0x{function:02X}"),
        None => bail!("empty response PDU"),
    }
}

pub struct ModbusPlc {
    addr: SocketAddr,
    unit_id: u8,
    timeout: Duration,
    coils: FxHashMap<String, u16>,
    conn: Mutex<Option<TcpStream>>,
    next_txn: AtomicU16,
}

impl ModbusPlc {
    /// Resolve and connect. Failure here is fatal to the caller.
    pub fn connect(cfg: &ModbusConfig) -> anyhow::Result<Self> {
        let addr = (cfg.host.as_str(), cfg.port)
            .to_socket_addrs()
            .with_context(|| format!("Failed to resolve PLC host {}:{}", cfg.host, cfg.port))?
            .next()
            .ok_or_else(|| anyhow!("No address for PLC host {}:{}", cfg.host, cfg.port))?;
        let timeout = Duration::from_millis(cfg.timeout_ms.max(1));

        let stream = Self::open(addr, timeout)
            .with_context(|| format!("Failed Modbus connect to {addr}"))?;
        info!(addr = %addr, unit_id = cfg.unit_id, coils = cfg.coils.len(), "plc_connected");

        Ok(Self {
            addr,
            unit_id: cfg.unit_id,
            timeout,
            coils: cfg.coils.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            conn: Mutex::new(Some(stream)),
            next_txn: AtomicU16::new(1),
        })
    }

    fn open(addr: SocketAddr, timeout: Duration) -> std::io::Result<TcpStream> {
        let stream = TcpStream::connect_timeout(&addr, timeout).inspect_err(|e| {
            log_connect_failed(&addr, e);
        })?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        Ok(stream)
    }

    fn coil(&self, tag: &str) -> Option<u16> {
        self.coils.get(tag).copied()
    }

    /// Send one request and return the response PDU
    fn transact(&self, pdu: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut guard = self.conn.lock();
        if guard.is_none() {
            debug!(addr = %self.addr, "plc_reconnecting");
            *guard = Some(Self::open(self.addr, self.timeout)?);
        }
        let Some(stream) = guard.as_mut() else {
            bail!("PLC session unavailable");
        };

        let txn_id = self.next_txn.fetch_add(1, Ordering::Relaxed);
        match Self::exchange(stream, txn_id, self.unit_id, pdu) {
            Ok(resp) => Ok(resp),
            Err(e) => {
                // Session state is unknown after a failed exchange
                *guard = None;
                log_io_error(&e);
                Err(e)
            }
        }
    }

    fn exchange(
        stream: &mut TcpStream,
        txn_id: u16,
        unit_id: u8,
        pdu: &[u8],
    ) -> anyhow::Result<Vec<u8>> {
        let frame = build_frame(txn_id, unit_id, pdu);
        stream.write_all(&frame).context("write request")?;

        let mut head = [0u8; MBAP_LEN];
        stream.read_exact(&mut head).context("read response header")?;
        let header = Header::parse(&head).ok_or_else(|| anyhow!("short MBAP header"))?;
        if header.txn_id != txn_id {
            bail!("transaction id mismatch: sent {txn_id}, got {}", header.txn_id);
        }
        if header.protocol != 0 {
            bail!("unexpected protocol id {}", header.protocol);
        }

        let mut resp = vec![0u8; header.pdu_len()?];
        stream.read_exact(&mut resp).context("read response body")?;
        Ok(resp)
    }

    fn write_coil(&self, addr: u16, on: bool) -> anyhow::Result<()> {
        let resp = self.transact(&write_coil_pdu(addr, on))?;
        check_function(FN_WRITE_SINGLE_COIL, &resp)
    }

    fn read_coil(&self, addr: u16) -> anyhow::Result<bool> {
        let resp = self.transact(&read_coils_pdu(addr, 1))?;
        check_function(FN_READ_COILS, &resp)?;
        match resp.as_slice() {
            [_, count, bits, ..] if *count >= 1 => Ok(bits & 0x01 != 0),
            _ => bail!("malformed read coils response"),
        }
    }
}

impl PlcClient for ModbusPlc {
    fn pulse(&self, tag: &str, duration: Duration) -> anyhow::Result<()> {
        let Some(addr) = self.coil(tag) else {
            warn!(tag = %tag, "plc_tag_not_configured");
            return Ok(());
        };

        self.write_coil(addr, true)?;
        thread::sleep(duration);
        // The output must not stay high: one retry on a fresh session
        if let Err(e) = self.write_coil(addr, false) {
            warn!(tag = %tag, error = %e, "plc_pulse_release_retry");
            self.write_coil(addr, false)?;
        }
        debug!(tag = %tag, coil = addr, ms = duration.as_millis() as u64, "plc_pulse");
        Ok(())
    }

    fn read_bool(&self, tag: &str) -> anyhow::Result<bool> {
        match self.coil(tag) {
            Some(addr) => self.read_coil(addr),
            None => Ok(false),
        }
    }

    fn close(&self) {
        if let Some(stream) = self.conn.lock().take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        info!(addr = %self.addr, "plc_closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::TcpListener;
    use std::sync::Arc;

    #[test]
    fn test_build_frame() {
        let frame = build_frame(0x0102, 7, &write_coil_pdu(5, true));
        assert_eq!(
            &frame[..],
            &[0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x07, 0x05, 0x00, 0x05, 0xFF, 0x00]
        );
    }

    #[test]
    fn test_header_parse() {
        let h = Header::parse(&[0x00, 0x09, 0x00, 0x00, 0x00, 0x04, 0x01]).unwrap();
        assert_eq!(h, Header { txn_id: 9, protocol: 0, len: 4, unit_id: 1 });
        assert_eq!(h.pdu_len().unwrap(), 3);
        assert!(Header::parse(&[0x00, 0x01]).is_none());
        let bad = Header { txn_id: 1, protocol: 0, len: 1, unit_id: 1 };
        assert!(bad.pdu_len().is_err());
    }

    #[test]
    fn test_check_function_exception() {
        assert!(check_function(FN_READ_COILS, &[0x01, 0x01, 0x00]).is_ok());
        let err = check_function(FN_READ_COILS, &[0x81, 0x02]).unwrap_err();
        assert!(err.to_string().contains("0x02"));
        assert!(check_function(FN_READ_COILS, &[]).is_err());
    }

    /// Minimal Modbus/TCP slave: serves coil reads/writes until the client hangs up
    fn spawn_slave() -> (SocketAddr, Arc<Mutex<Vec<(u16, bool)>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let writes = Arc::new(Mutex::new(Vec::new()));
        let log = writes.clone();

        thread::spawn(move || {
            let mut coils: HashMap<u16, bool> = HashMap::new();
            coils.insert(9, true);
            for conn in listener.incoming() {
                let Ok(mut s) = conn else { return };
                loop {
                    let mut head = [0u8; MBAP_LEN];
                    if s.read_exact(&mut head).is_err() {
                        break;
                    }
                    let h = Header::parse(&head).unwrap();
                    let mut pdu = vec![0u8; h.pdu_len().unwrap()];
                    s.read_exact(&mut pdu).unwrap();
                    let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
                    let resp: Vec<u8> = match pdu[0] {
                        FN_WRITE_SINGLE_COIL => {
                            let on = u16::from_be_bytes([pdu[3], pdu[4]]) == COIL_ON;
                            coils.insert(addr, on);
                            log.lock().push((addr, on));
                            pdu.clone()
                        }
                        FN_READ_COILS if addr < 100 => {
                            let bit = coils.get(&addr).copied().unwrap_or(false) as u8;
                            vec![FN_READ_COILS, 1, bit]
                        }
                        f => vec![f | EXCEPTION_BIT, 0x02],
                    };
                    let out = build_frame(h.txn_id, h.unit_id, &resp);
                    s.write_all(&out).unwrap();
                }
            }
        });
        (addr, writes)
    }

    fn client(addr: SocketAddr) -> ModbusPlc {
        let mut coils = HashMap::new();
        coils.insert("caster_5_new".to_string(), 3u16);
        coils.insert("gate1_is_open".to_string(), 9u16);
        coils.insert("bad_coil".to_string(), 500u16);
        let cfg = ModbusConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            unit_id: 1,
            timeout_ms: 1000,
            coils,
        };
        ModbusPlc::connect(&cfg).unwrap()
    }

    #[test]
    fn test_pulse_writes_high_then_low() {
        let (addr, writes) = spawn_slave();
        let plc = client(addr);

        plc.pulse("caster_5_new", Duration::from_millis(20)).unwrap();
        assert_eq!(*writes.lock(), vec![(3, true), (3, false)]);
        plc.close();
    }

    #[test]
    fn test_unconfigured_tag_is_soft() {
        let (addr, writes) = spawn_slave();
        let plc = client(addr);

        plc.pulse("not_wired", Duration::from_millis(1)).unwrap();
        assert!(writes.lock().is_empty());
        assert!(!plc.read_bool("not_wired").unwrap());
    }

    #[test]
    fn test_read_coil_and_exception() {
        let (addr, _) = spawn_slave();
        let plc = client(addr);

        assert!(plc.read_bool("gate1_is_open").unwrap());
        assert!(plc.read_bool("bad_coil").is_err());
        // Session survives an exception response
        assert!(plc.read_bool("gate1_is_open").unwrap());
    }
}
