use crate::domain::error::LinkError;
use std::fmt;

/// Upper bound of every actuator angle, in degrees.
pub const MAX_ANGLE: u8 = 180;

/// Number of actuators on the rig.
pub const ACTUATOR_COUNT: usize = 4;

/// Position snapshot of the four actuators, each in 0..=180.
///
/// Either a desired position (to upload) or an observed one (downloaded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActuatorAngles([u8; ACTUATOR_COUNT]);

impl ActuatorAngles {
    pub const ZERO: Self = Self([0; ACTUATOR_COUNT]);

    pub fn new(angles: [u8; ACTUATOR_COUNT]) -> Result<Self, LinkError> {
        match angles.iter().find(|&&a| a > MAX_ANGLE) {
            Some(&bad) => Err(LinkError::InvalidAngle(bad as i64)),
            None => Ok(Self(angles)),
        }
    }

    /// Build from wider integers, e.g. operator input.
    pub fn from_values(values: [i64; ACTUATOR_COUNT]) -> Result<Self, LinkError> {
        let mut angles = [0u8; ACTUATOR_COUNT];
        for (slot, value) in angles.iter_mut().zip(values) {
            if !(0..=MAX_ANGLE as i64).contains(&value) {
                return Err(LinkError::InvalidAngle(value));
            }
            *slot = value as u8;
        }
        Ok(Self(angles))
    }

    pub fn as_array(&self) -> [u8; ACTUATOR_COUNT] {
        self.0
    }
}

impl fmt::Display for ActuatorAngles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a1, a2, a3, a4] = self.0;
        write!(f, "[1: {a1:03}] [2: {a2:03}] [3: {a3:03}] [4: {a4:03}]")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Adapter missing; the session is over.
    Failed,
}

/// Events delivered to the operator interface.
#[derive(Debug, Clone)]
pub enum AppEvent {
    ConnectionState(ConnectionState),
    ConnectStarted { address: String },
    /// `positions` is the initial download when `success` is true.
    ConnectFinished {
        success: bool,
        positions: Option<ActuatorAngles>,
    },
    UploadFinished { success: bool },
    DownloadFinished { positions: Option<ActuatorAngles> },
    DemoTick(ActuatorAngles),
    DemoStopped,
    LogMessage(StatusMessage),
}

/// Intents coming from the operator interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    SetAngles(ActuatorAngles),
    StartDemo,
    StopDemo,
    /// Re-read the device positions.
    Refresh,
    /// Retry after a connection attempt gave up (e.g. device not paired).
    Reconnect,
    /// Abort the waiting-for-connection state, or leave an active session.
    CancelConnection,
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
