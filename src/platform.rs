//! ESP32-C3 adapters: the RMT transmitter behind `PulseOutput` and the
//! embassy-net UDP socket behind `DatagramSocket`.

use crate::BoardError;
use crate::led_control::{LinkError, LinkStatus, PulseOutput, Renderer};
use crate::udp_server::DatagramSocket;
use alloc::vec::Vec;
use embassy_net::IpEndpoint;
use embassy_net::udp::UdpSocket;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, TrySendError};
use esp_hal::rmt::TxChannel;
use log::{error, warn};

/// One encoded frame in flight between the renderer and the RMT task
pub type FrameChannel = Channel<CriticalSectionRawMutex, Vec<u32>, 1>;

/// Queues frames for [`drive_rmt`]; completion is reported back through
/// `Renderer::complete_transmission`.
pub struct RmtLink {
    frames: &'static FrameChannel,
}

impl RmtLink {
    pub const fn new(frames: &'static FrameChannel) -> Self {
        Self { frames }
    }
}

impl PulseOutput for RmtLink {
    fn start(&self, pulses: Vec<u32>) -> Result<LinkStatus, LinkError> {
        self.frames
            .try_send(pulses)
            .map(|()| LinkStatus::Pending)
            .map_err(|TrySendError::Full(pulses)| LinkError {
                error: BoardError::Busy,
                pulses,
            })
    }
}

/// RMT task body: puts each queued frame on the wire and hands the pulse
/// buffer back to the renderer.
pub async fn drive_rmt<TX: TxChannel>(
    channel: TX,
    frames: &FrameChannel,
    renderer: &Renderer<RmtLink>,
) -> ! {
    let mut channel = Some(channel);

    loop {
        let pulses = frames.receive().await;

        match channel.take() {
            Some(tx) => match tx.transmit(&pulses) {
                Ok(transaction) => match transaction.wait() {
                    Ok(tx) => channel = Some(tx),
                    Err((e, tx)) => {
                        // LED transmission often succeeds despite warnings
                        warn!("[LED] RMT transmit reported {:?}", e);
                        channel = Some(tx);
                    }
                },
                Err(e) => error!("[LED] RMT transmit failed, channel lost: {:?}", e),
            },
            None => warn!("[LED] No RMT channel, frame dropped"),
        }

        renderer.complete_transmission(pulses);
    }
}

/// embassy-net UDP socket
pub struct NetSocket<'a> {
    socket: UdpSocket<'a>,
}

impl<'a> NetSocket<'a> {
    pub fn new(socket: UdpSocket<'a>) -> Self {
        Self { socket }
    }
}

impl DatagramSocket for NetSocket<'_> {
    type Endpoint = IpEndpoint;

    fn bind(&mut self, port: u16) -> Result<(), BoardError> {
        self.socket.bind(port).map_err(|e| {
            warn!("[UDP] Bind error: {:?}", e);
            BoardError::UdpError
        })
    }

    async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, IpEndpoint), BoardError> {
        let (len, meta) = self.socket.recv_from(buf).await.map_err(|e| {
            warn!("[UDP] Receive error: {:?}", e);
            BoardError::UdpError
        })?;
        Ok((len, meta.endpoint))
    }

    async fn send_to(&mut self, data: &[u8], to: IpEndpoint) -> Result<(), BoardError> {
        self.socket
            .send_to(data, to)
            .await
            .map_err(|_| BoardError::UdpError)
    }

    fn close(&mut self) {
        self.socket.close();
    }
}
