use super::color::{Rgbw, rgbw};

/// LED status states for visual feedback on pixel 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedStatus {
    // System initialization
    Starting,

    // Network connection states
    Connecting,
    NetworkReady,

    // Operational
    Operational,

    // Error states
    NetworkError,
    ServiceError,

    // Recovery states (reconnecting, host lost)
    Recovering,
}

impl LedStatus {
    pub const fn color(self) -> Rgbw {
        match self {
            LedStatus::Starting => rgbw(0, 0, 0, 255),
            LedStatus::Connecting => rgbw(0, 0, 255, 0),
            LedStatus::NetworkReady => rgbw(0, 255, 0, 0),
            LedStatus::Operational => rgbw(128, 0, 128, 0),
            LedStatus::NetworkError => rgbw(255, 0, 0, 0),
            LedStatus::ServiceError => rgbw(255, 128, 0, 0),
            LedStatus::Recovering => rgbw(255, 255, 0, 0),
        }
    }
}
