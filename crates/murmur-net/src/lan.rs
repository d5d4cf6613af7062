//! LAN transport: UDP broadcast discovery + TCP exchange channel

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, warn};

use crate::framing::{FrameError, MAX_FRAME_SIZE};
use crate::peer::TransportKind;
use crate::transport::{Discovery, InboundHandler, Transport, TransportError, TransportEvent};

/// UDP broadcast discovery port.
pub const LAN_DISCOVERY_PORT: u16 = 41234;

/// Discovery packet shape, fixed by the protocol:
/// `{magic, type, version, device_id, ip, port, timestamp}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LanHelloPacket {
    pub magic: String,
    #[serde(rename = "type")]
    pub packet_type: LanPacketType,
    pub version: u32,
    pub device_id: String,
    pub ip: String,
    pub port: u16,
    pub timestamp: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LanPacketType {
    #[serde(rename = "HELLO")]
    Hello,
    #[serde(rename = "HELLO_RESP")]
    HelloResp,
}

const LAN_MAGIC: &str = "MURMUR_LAN";
const LAN_PROTOCOL_VERSION: u32 = 1;

fn now_ms() -> u64 {
    SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_millis() as u64
}

impl LanHelloPacket {
    fn new(packet_type: LanPacketType, device_id: String, ip: String, tcp_port: u16) -> Self {
        Self {
            magic: LAN_MAGIC.to_string(),
            packet_type,
            version: LAN_PROTOCOL_VERSION,
            device_id,
            ip,
            port: tcp_port,
            timestamp: now_ms(),
        }
    }
}

/// A concrete [`Transport`] for LAN discovery (UDP broadcast) and exchange
/// (TCP request/response).
pub struct LanTransport {
    device_id: String,
    tcp_port: u16,
    events: Arc<Mutex<Vec<TransportEvent>>>,
}

impl LanTransport {
    /// Bind the UDP discovery socket and TCP listener, and spawn the
    /// background tasks that drive both. `device_id` is advertised in every
    /// HELLO/HELLO_RESP packet; `tcp_port` is the exchange listener's port;
    /// `handler` computes the reply to every accepted exchange connection
    ///.
    pub async fn bind(
        device_id: String,
        tcp_port: u16,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Arc<Self>, TransportError> {
        Self::bind_with_discovery_port(device_id, tcp_port, LAN_DISCOVERY_PORT, handler).await
    }

    /// Like [`LanTransport::bind`], but binds the UDP discovery listener to
    /// `discovery_port` instead of the fixed protocol port. Production code
    /// should always go through `bind`; this exists so tests that spin up
    /// multiple transports in one process don't contend for port 41234.
    pub async fn bind_with_discovery_port(
        device_id: String,
        tcp_port: u16,
        discovery_port: u16,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Arc<Self>, TransportError> {
        let transport = Arc::new(Self {
                device_id,
                tcp_port,
                events: Arc::new(Mutex::new(Vec::new())),
        });

        transport.clone().spawn_discovery_listener(discovery_port).await?;
        transport.clone().spawn_tcp_listener(handler).await?;

        Ok(transport)
    }

    async fn spawn_discovery_listener(self: Arc<Self>, discovery_port: u16) -> Result<(), TransportError> {
        let socket = UdpSocket::bind(("0.0.0.0", discovery_port)).await?;
        socket.set_broadcast(true)?;

        tokio::spawn(async move {
                let mut buf = vec![0u8; 2048];
                loop {
                    let (len, from) = match socket.recv_from(&mut buf).await {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("lan discovery recv error: {e}");
                            continue;
                        }
                    };
                    self.handle_discovery_packet(&buf[..len], from, &socket).await;
                }
        });
        Ok(())
    }

    async fn handle_discovery_packet(&self, bytes: &[u8], from: SocketAddr, socket: &UdpSocket) {
        let packet: LanHelloPacket = match serde_json::from_slice(bytes) {
            Ok(p) if p.magic == LAN_MAGIC => p,
            _ => return,
        };
        if packet.device_id == self.device_id {
            return; // our own broadcast, looped back
        }

        self.events.lock().push(TransportEvent::PeerDiscovered(Discovery {
                    address: format!("{}:{}", packet.ip, packet.port),
                    public_id_hint: Some(packet.device_id.clone()),
                    signal_strength: None,
                    port: Some(packet.port),
        }));

        if packet.packet_type == LanPacketType::Hello {
            let reply = LanHelloPacket::new(
                LanPacketType::HelloResp,
                self.device_id.clone(),
                local_ip_guess(),
                self.tcp_port,
            );
            if let Ok(body) = serde_json::to_vec(&reply) {
                if let Err(e) = socket.send_to(&body, from).await {
                    debug!("lan hello_resp send failed: {e}");
                }
            }
        }
    }

    /// Broadcast a HELLO packet to the subnet-directed broadcast address.
    pub async fn announce(&self, broadcast_addr: SocketAddr) -> Result<(), TransportError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.set_broadcast(true)?;
        let packet = LanHelloPacket::new(
            LanPacketType::Hello,
            self.device_id.clone(),
            local_ip_guess(),
            self.tcp_port,
        );
        let body = serde_json::to_vec(&packet).map_err(|e| TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        socket.send_to(&body, broadcast_addr).await?;
        Ok(())
    }

    async fn spawn_tcp_listener(self: Arc<Self>, handler: Arc<dyn InboundHandler>) -> Result<(), TransportError> {
        let listener = TcpListener::bind(("0.0.0.0", self.tcp_port)).await?;
        tokio::spawn(async move {
                loop {
                    let (stream, addr) = match listener.accept().await {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("lan tcp accept error: {e}");
                            continue;
                        }
                    };
                    let handler = handler.clone();
                    tokio::spawn(async move {
                            if let Err(e) = handle_inbound_stream(stream, addr, handler).await {
                                debug!("lan tcp session with {addr} ended: {e}");
                            }
                    });
                }
        });
        Ok(())
    }
}

async fn handle_inbound_stream(
    mut stream: TcpStream,
    addr: SocketAddr,
    handler: Arc<dyn InboundHandler>,
) -> Result<(), TransportError> {
    let frame = read_one_frame(&mut stream).await?;
    let reply = handler.handle(&addr.to_string(), frame).await;
    write_one_frame(&mut stream, &reply).await?;
    Ok(())
}

async fn read_one_frame(stream: &mut TcpStream) -> Result<Vec<u8>, TransportError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len).into());
    }
    let mut body = vec![0u8; len];
    stream
    .read_exact(&mut body)
    .await
    .map_err(|_| TransportError::Framing(FrameError::Truncated))?;
    Ok(body)
}

async fn write_one_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<(), TransportError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(payload.len()).into());
    }
    stream.write_u32(payload.len() as u32).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

fn local_ip_guess() -> String {
    // Best-effort local address discovery: connect a UDP socket to a
    // public address without sending anything, and read back the local
    // endpoint the OS picked for that route.
    std::net::UdpSocket::bind("0.0.0.0:0")
    .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
    })
    .map(|a| a.ip().to_string())
    .unwrap_or_else(|_| "0.0.0.0".to_string())
}

#[async_trait]
impl Transport for LanTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Lan
    }

    async fn request(&self, peer_address: &str, payload: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let mut stream = TcpStream::connect(peer_address)
        .await
        .map_err(|_| TransportError::Unreachable(peer_address.to_string()))?;
        write_one_frame(&mut stream, &payload).await?;
        read_one_frame(&mut stream).await
    }

    async fn poll_events(&self) -> Vec<TransportEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}
