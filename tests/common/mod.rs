#![allow(dead_code)]

use ambient_board::BoardError;
use ambient_board::led_control::animation::BreathingConfig;
use ambient_board::led_control::color::ChannelOrder;
use ambient_board::led_control::{LinkError, LinkStatus, PulseOutput, Renderer, pulse};
use ambient_board::state_machine::SystemEvent;
use ambient_board::udp_server::{DatagramSocket, EventSink, PixelSink};
use core::cell::{Cell, RefCell};
use std::collections::VecDeque;

/// How [`RecordingOutput`] finishes a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    /// Hands the buffer straight back, like a blocking transmitter
    Immediate,
    /// Keeps the buffer until the test completes the frame
    Deferred,
}

/// Transmitter that keeps a copy of every frame it is given.
pub struct RecordingOutput {
    pub frames: RefCell<Vec<Vec<u32>>>,
    /// Address and capacity of each pulse buffer handed in
    pub buffers: RefCell<Vec<(usize, usize)>>,
    pub in_flight: RefCell<Option<Vec<u32>>>,
    pub link: Link,
    pub fail: Cell<bool>,
}

impl RecordingOutput {
    pub fn new(link: Link) -> Self {
        Self {
            frames: RefCell::new(Vec::new()),
            buffers: RefCell::new(Vec::new()),
            in_flight: RefCell::new(None),
            link,
            fail: Cell::new(false),
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.borrow().len()
    }

    /// Bytes of the most recent frame.
    pub fn last_frame(&self) -> Option<Vec<u8>> {
        self.frames.borrow().last().map(|pulses| decode(pulses))
    }

    pub fn take_in_flight(&self) -> Vec<u32> {
        self.in_flight.borrow_mut().take().expect("frame in flight")
    }
}

impl PulseOutput for RecordingOutput {
    fn start(&self, pulses: Vec<u32>) -> Result<LinkStatus, LinkError> {
        if self.fail.get() {
            return Err(LinkError {
                error: BoardError::LedError,
                pulses,
            });
        }
        self.buffers
            .borrow_mut()
            .push((pulses.as_ptr() as usize, pulses.capacity()));
        self.frames.borrow_mut().push(pulses.clone());
        match self.link {
            Link::Immediate => Ok(LinkStatus::Completed(pulses)),
            Link::Deferred => {
                *self.in_flight.borrow_mut() = Some(pulses);
                Ok(LinkStatus::Pending)
            }
        }
    }
}

/// Complete the frame a deferred output is holding.
pub fn finish(r: &Renderer<RecordingOutput>) {
    r.complete_transmission(r.output().take_in_flight());
}

/// Turn a pulse train back into bytes.
pub fn decode(pulses: &[u32]) -> Vec<u8> {
    let (reset, bits) = pulses.split_last().expect("frame has a reset item");
    assert_eq!(*reset, pulse::RESET);
    assert_eq!(bits.len() % 8, 0);
    bits.chunks(8)
        .map(|byte| {
            byte.iter().fold(0u8, |acc, &item| {
                assert!(item == pulse::ONE_BIT || item == pulse::ZERO_BIT);
                (acc << 1) | (item == pulse::ONE_BIT) as u8
            })
        })
        .collect()
}

pub fn renderer(led_count: usize, link: Link) -> Renderer<RecordingOutput> {
    renderer_with(led_count, link, BreathingConfig::default())
}

pub fn renderer_with(
    led_count: usize,
    link: Link,
    breathing: BreathingConfig,
) -> Renderer<RecordingOutput> {
    Renderer::initialize(
        RecordingOutput::new(link),
        4,
        led_count,
        ChannelOrder::grbw(),
        breathing,
    )
    .expect("renderer")
}

/// In-memory socket. Endpoints are plain port numbers.
#[derive(Default)]
pub struct FakeSocket {
    pub incoming: VecDeque<(Vec<u8>, u16)>,
    pub sent: Vec<(Vec<u8>, u16)>,
    pub bound: Option<u16>,
    pub binds: usize,
    pub closed: usize,
    pub fail_bind: bool,
}

impl FakeSocket {
    pub fn with_datagrams(datagrams: &[&[u8]]) -> Self {
        Self {
            incoming: datagrams
                .iter()
                .enumerate()
                .map(|(i, d)| (d.to_vec(), 40000 + i as u16))
                .collect(),
            ..Self::default()
        }
    }
}

impl DatagramSocket for FakeSocket {
    type Endpoint = u16;

    fn bind(&mut self, port: u16) -> Result<(), BoardError> {
        if self.fail_bind {
            return Err(BoardError::UdpError);
        }
        self.bound = Some(port);
        self.binds += 1;
        Ok(())
    }

    async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, u16), BoardError> {
        match self.incoming.pop_front() {
            Some((data, from)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok((len, from))
            }
            None => core::future::pending().await,
        }
    }

    async fn send_to(&mut self, data: &[u8], to: u16) -> Result<(), BoardError> {
        self.sent.push((data.to_vec(), to));
        Ok(())
    }

    fn close(&mut self) {
        self.bound = None;
        self.closed += 1;
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub writes: RefCell<Vec<(usize, Vec<u8>)>>,
    pub transmits: Cell<usize>,
}

impl PixelSink for RecordingSink {
    fn write_pixels(&self, offset: usize, data: &[u8]) {
        self.writes.borrow_mut().push((offset, data.to_vec()));
    }

    fn request_transmit(&self) {
        self.transmits.set(self.transmits.get() + 1);
    }
}

/// Event sink that records events. With `hang_on_probe` set, posting a
/// probe never completes.
#[derive(Default)]
pub struct RecordingEvents {
    pub events: RefCell<Vec<SystemEvent>>,
    pub hang_on_probe: bool,
}

impl EventSink for RecordingEvents {
    async fn post(&self, event: SystemEvent) -> Result<(), BoardError> {
        self.events.borrow_mut().push(event);
        if self.hang_on_probe && event == SystemEvent::ProbeReceived {
            core::future::pending::<()>().await;
        }
        Ok(())
    }
}
