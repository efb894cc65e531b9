//! UDP communication server module
//!
//! Receives datagrams, decodes them and dispatches probes to the state
//! machine and pixel data to the renderer. The socket, the pixel sink and
//! the event sink are traits so the server runs against embassy-net on the
//! board and against in-memory fakes in tests.

use crate::config::{self, MAX_PACKET_SIZE};
use crate::state_machine::SystemEvent;
use crate::BoardError;
use core::cell::RefCell;
use core::fmt;
use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, with_timeout};
use log::{debug, error, info, warn};

/// Type byte + 16-bit big-endian offset
pub const HEADER_SIZE: usize = 3;

/// How long a receive may block before the run flag is checked again
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

/// How long `stop` waits for the reader before dropping it
pub const STOP_GRACE: Duration = Duration::from_millis(200);

/// Decoded datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet<'a> {
    /// 0x01 connection check
    Probe,
    /// 0x02 pixel data starting at byte `offset` of the pixel buffer
    PixelData { offset: u16, data: &'a [u8] },
    /// Known type that carries nothing yet
    Reserved(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    Empty,
    TooShort(usize),
    OutOfBounds { offset: usize, len: usize, limit: usize },
    UnknownType(u8),
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketError::Empty => f.write_str("empty packet"),
            PacketError::TooShort(len) => {
                write!(f, "packet too short: {} bytes (minimum {} required)", len, HEADER_SIZE)
            }
            PacketError::OutOfBounds { offset, len, limit } => {
                write!(f, "offset {} + {} bytes exceeds {} byte buffer", offset, len, limit)
            }
            PacketError::UnknownType(t) => write!(f, "unknown packet type 0x{:02x}", t),
        }
    }
}

impl<'a> Packet<'a> {
    /// Parse raw packet data according to the wire protocol.
    ///
    /// Pixel payloads need not cover whole pixels; a frame may be split
    /// across datagrams at any byte.
    pub fn parse(data: &'a [u8], max_buffer_bytes: usize) -> Result<Self, PacketError> {
        let (&kind, _) = data.split_first().ok_or(PacketError::Empty)?;

        match kind {
            config::CONNECTION_CHECK_HEADER => Ok(Packet::Probe),
            config::PROTOCOL_HEADER => {
                if data.len() < HEADER_SIZE {
                    return Err(PacketError::TooShort(data.len()));
                }
                let offset = u16::from_be_bytes([data[1], data[2]]);
                let payload = &data[HEADER_SIZE..];
                if offset as usize + payload.len() > max_buffer_bytes {
                    return Err(PacketError::OutOfBounds {
                        offset: offset as usize,
                        len: payload.len(),
                        limit: max_buffer_bytes,
                    });
                }
                Ok(Packet::PixelData {
                    offset,
                    data: payload,
                })
            }
            t if config::RESERVED_HEADERS.contains(&t) => Ok(Packet::Reserved(t)),
            t => Err(PacketError::UnknownType(t)),
        }
    }
}

/// Datagram endpoint the server reads from.
#[allow(async_fn_in_trait)]
pub trait DatagramSocket {
    type Endpoint: Copy + fmt::Debug;

    fn bind(&mut self, port: u16) -> Result<(), BoardError>;
    async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, Self::Endpoint), BoardError>;
    async fn send_to(&mut self, data: &[u8], to: Self::Endpoint) -> Result<(), BoardError>;
    fn close(&mut self);
}

/// Receiver of pixel data.
pub trait PixelSink {
    fn write_pixels(&self, offset: usize, data: &[u8]);
    fn request_transmit(&self);
}

/// Receiver of lifecycle events.
#[allow(async_fn_in_trait)]
pub trait EventSink {
    async fn post(&self, event: SystemEvent) -> Result<(), BoardError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub packets: u32,
    pub bytes: u32,
    pub pixel_packets: u32,
    pub probe_packets: u32,
    pub ignored_packets: u32,
    pub invalid_packets: u32,
}

struct ServerState {
    running: bool,
    /// Bumped by every `start`; a session only serves its own generation
    generation: u32,
    stats: ServerStats,
}

/// UDP server for receiving LED data packets
pub struct ProtocolServer {
    port: u16,
    max_buffer_bytes: usize,
    state: Mutex<CriticalSectionRawMutex, RefCell<ServerState>>,
    start: Signal<CriticalSectionRawMutex, ()>,
    exited: Signal<CriticalSectionRawMutex, ()>,
    abort: Signal<CriticalSectionRawMutex, ()>,
}

impl ProtocolServer {
    /// `max_buffer_bytes` bounds pixel packet offsets.
    pub const fn new(port: u16, max_buffer_bytes: usize) -> Self {
        Self {
            port,
            max_buffer_bytes,
            state: Mutex::new(RefCell::new(ServerState {
                running: false,
                generation: 0,
                stats: ServerStats {
                    packets: 0,
                    bytes: 0,
                    pixel_packets: 0,
                    probe_packets: 0,
                    ignored_packets: 0,
                    invalid_packets: 0,
                },
            })),
            start: Signal::new(),
            exited: Signal::new(),
            abort: Signal::new(),
        }
    }

    /// Get the bound port
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_running(&self) -> bool {
        self.state.lock(|s| s.borrow().running)
    }

    fn is_current(&self, generation: u32) -> bool {
        self.state.lock(|s| {
            let s = s.borrow();
            s.running && s.generation == generation
        })
    }

    pub fn stats(&self) -> ServerStats {
        self.state.lock(|s| s.borrow().stats)
    }

    pub fn reset_stats(&self) {
        self.state.lock(|s| s.borrow_mut().stats = ServerStats::default());
    }

    fn update_stats(&self, f: impl FnOnce(&mut ServerStats)) {
        self.state.lock(|s| f(&mut s.borrow_mut().stats));
    }

    /// Ask the reader task to bind and listen. No-op if already running.
    pub fn start(&self) {
        let started = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            if s.running {
                return false;
            }
            s.running = true;
            s.generation = s.generation.wrapping_add(1);
            true
        });
        if started {
            info!("[UDP] Starting server on port {}", self.port);
            self.exited.reset();
            self.start.signal(());
        }
    }

    /// Clear the run flag without waiting. The reader notices within one
    /// receive timeout.
    pub fn request_stop(&self) -> bool {
        self.state
            .lock(|s| core::mem::replace(&mut s.borrow_mut().running, false))
    }

    /// Stop the reader, waiting up to `STOP_GRACE` before dropping it.
    /// Idempotent.
    pub async fn stop(&self) {
        if !self.request_stop() {
            return;
        }
        info!("[UDP] Stopping server");
        if with_timeout(STOP_GRACE, self.exited.wait()).await.is_err() {
            warn!("[UDP] Reader did not stop within grace period, terminating");
            self.abort.signal(());
        }
    }

    /// Reader task body. Each `start` opens one listening session on
    /// `socket`; the session ends on `stop` or a bind failure.
    pub async fn serve<S, P, E>(&self, socket: &mut S, sink: &P, events: &E) -> !
    where
        S: DatagramSocket,
        P: PixelSink,
        E: EventSink,
    {
        let mut buffer = [0u8; MAX_PACKET_SIZE];

        loop {
            self.start.wait().await;
            let generation = self.state.lock(|s| s.borrow().generation);
            if !self.is_current(generation) {
                continue;
            }
            self.abort.reset();

            match select(
                self.session(generation, socket, &mut buffer, sink, events),
                self.abort.wait(),
            )
            .await
            {
                Either::First(()) => info!("[UDP] Server stopped"),
                Either::Second(()) => warn!("[UDP] Server terminated"),
            }

            socket.close();
            self.state.lock(|s| {
                let mut s = s.borrow_mut();
                if s.generation == generation {
                    s.running = false;
                }
            });
            self.exited.signal(());
        }
    }

    async fn session<S, P, E>(
        &self,
        generation: u32,
        socket: &mut S,
        buffer: &mut [u8],
        sink: &P,
        events: &E,
    ) where
        S: DatagramSocket,
        P: PixelSink,
        E: EventSink,
    {
        if let Err(e) = socket.bind(self.port) {
            error!("[UDP] Failed to bind to port {}: {}", self.port, e);
            post(events, SystemEvent::ServiceFailed).await;
            return;
        }

        info!("[UDP] UDP server listening on port {}", self.port);
        post(events, SystemEvent::ServiceStarted).await;
        post(events, SystemEvent::ServiceListening).await;

        while self.is_current(generation) {
            match with_timeout(RECEIVE_TIMEOUT, socket.recv_from(buffer)).await {
                // Poll interval for the run flag
                Err(_) => continue,
                Ok(Err(e)) => warn!("[UDP] Error receiving packet: {}", e),
                Ok(Ok((len, from))) => {
                    self.dispatch(&buffer[..len], from, socket, sink, events)
                        .await
                }
            }
        }
    }

    async fn dispatch<S, P, E>(
        &self,
        datagram: &[u8],
        from: S::Endpoint,
        socket: &mut S,
        sink: &P,
        events: &E,
    ) where
        S: DatagramSocket,
        P: PixelSink,
        E: EventSink,
    {
        self.update_stats(|s| {
            s.packets = s.packets.wrapping_add(1);
            s.bytes = s.bytes.wrapping_add(datagram.len() as u32);
        });

        match Packet::parse(datagram, self.max_buffer_bytes) {
            Ok(Packet::Probe) => {
                self.update_stats(|s| s.probe_packets = s.probe_packets.wrapping_add(1));
                debug!("[UDP] Connection check from {:?}", from);
                post(events, SystemEvent::ProbeReceived).await;
                let response = [config::CONNECTION_CHECK_HEADER];
                if let Err(e) = socket.send_to(&response, from).await {
                    warn!("[UDP] Failed to send connection response: {}", e);
                }
            }
            Ok(Packet::PixelData { offset, data }) => {
                self.update_stats(|s| s.pixel_packets = s.pixel_packets.wrapping_add(1));
                sink.write_pixels(offset as usize, data);
                sink.request_transmit();
            }
            Ok(Packet::Reserved(kind)) => {
                self.update_stats(|s| s.ignored_packets = s.ignored_packets.wrapping_add(1));
                debug!("[UDP] Ignoring 0x{:02x} packet ({} bytes)", kind, datagram.len());
            }
            Err(e) => {
                self.update_stats(|s| s.invalid_packets = s.invalid_packets.wrapping_add(1));
                warn!("[UDP] Dropped packet from {:?}: {}", from, e);
            }
        }
    }
}

async fn post<E: EventSink>(events: &E, event: SystemEvent) {
    if let Err(e) = events.post(event).await {
        warn!("[UDP] Could not post {}: {}", event, e);
    }
}
