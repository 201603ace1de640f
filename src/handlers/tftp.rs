//! TFTP decoy (UDP)
//!
//! Read requests always fail, write requests are acknowledged and the data is
//! thrown away. Replies are sent from the listening port.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::{HandlerContext, Listening};
use crate::pool::WorkerPool;
use crate::report::Reporter;
use crate::session::ProtocolKind;

pub const DISPLAY_NAME: &str = "TFTP 69 decoy";

const OP_RRQ: u16 = 1;
const OP_WRQ: u16 = 2;
const OP_DATA: u16 = 3;
const OP_ACK: u16 = 4;
const OP_ERROR: u16 = 5;

const ERR_NOT_FOUND: u16 = 1;
const ERR_ILLEGAL: u16 = 4;

#[derive(Debug, PartialEq, Eq)]
pub enum Packet {
    Read { filename: String, mode: String },
    Write { filename: String, mode: String },
    Data { block: u16, len: usize },
    Ack { block: u16 },
    Error { code: u16, message: String },
}

pub fn parse(packet: &[u8]) -> Option<Packet> {
    if packet.len() < 4 {
        return None;
    }
    let opcode = u16::from_be_bytes([packet[0], packet[1]]);
    let rest = &packet[2..];
    let block = u16::from_be_bytes([rest[0], rest[1]]);

    match opcode {
        OP_RRQ | OP_WRQ => {
            let mut fields = rest.split(|b| *b == 0);
            let filename = String::from_utf8_lossy(fields.next()?).into_owned();
            let mode = String::from_utf8_lossy(fields.next()?).into_owned();
            if filename.is_empty() || mode.is_empty() {
                return None;
            }
            Some(if opcode == OP_RRQ {
                Packet::Read { filename, mode }
            } else {
                Packet::Write { filename, mode }
            })
        }
        OP_DATA => Some(Packet::Data { block, len: rest.len() - 2 }),
        OP_ACK => Some(Packet::Ack { block }),
        OP_ERROR => {
            let message = rest[2..].split(|b| *b == 0).next().unwrap_or_default();
            Some(Packet::Error {
                code: block,
                message: String::from_utf8_lossy(message).into_owned(),
            })
        }
        _ => None,
    }
}

fn ack(block: u16) -> Vec<u8> {
    let mut out = OP_ACK.to_be_bytes().to_vec();
    out.extend_from_slice(&block.to_be_bytes());
    out
}

fn error(code: u16, message: &str) -> Vec<u8> {
    let mut out = OP_ERROR.to_be_bytes().to_vec();
    out.extend_from_slice(&code.to_be_bytes());
    out.extend_from_slice(message.as_bytes());
    out.push(0);
    out
}

/// Reply for one datagram, plus the report line for request packets
pub fn respond(packet: &[u8]) -> (Option<Vec<u8>>, Option<String>) {
    match parse(packet) {
        Some(Packet::Read { filename, mode }) => (
            Some(error(ERR_NOT_FOUND, "File not found")),
            Some(format!("RRQ {} {}", filename, mode)),
        ),
        Some(Packet::Write { filename, mode }) => (Some(ack(0)), Some(format!("WRQ {} {}", filename, mode))),
        Some(Packet::Data { block, .. }) => (Some(ack(block)), None),
        Some(Packet::Ack { .. }) | Some(Packet::Error { .. }) => (None, None),
        None => (Some(error(ERR_ILLEGAL, "Illegal TFTP operation")), None),
    }
}

pub async fn start(addr: &str, ctx: Arc<HandlerContext>) -> Result<Listening> {
    let socket = Arc::new(UdpSocket::bind(addr).await?);
    let local_addr = socket.local_addr()?.to_string();
    info!("TFTP honeypot started on {}", local_addr);

    let pool = WorkerPool::new(ctx.pool_capacity);
    let task = tokio::spawn(serve(socket, pool.clone(), ctx.reporter.clone()));
    Ok(Listening::new(local_addr, task).with_pool(pool))
}

async fn serve(socket: Arc<UdpSocket>, pool: WorkerPool, reporter: Reporter) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("TFTP receive error on 127.0.0.1: {}", e);
                continue;
            }
        };

        let datagram = buf[..n].to_vec();
        let socket = socket.clone();
        let reporter = reporter.clone();
        let task = async move { process(&socket, &reporter, &datagram, peer).await };
        if pool.submit(task).await.is_err() {
            return;
        }
    }
}

async fn process(socket: &UdpSocket, reporter: &Reporter, datagram: &[u8], peer: SocketAddr) {
    let (reply, info) = respond(datagram);
    if let Some(info) = info {
        debug!("TFTP {} from {}", info, peer);
        reporter.spawn_created(ProtocolKind::Tftp, DISPLAY_NAME, &peer.ip().to_string(), info);
    }
    if let Some(reply) = reply {
        if let Err(e) = socket.send_to(&reply, peer).await {
            debug!("TFTP send error to {}: {}", peer.ip(), e);
        }
    }
}
