use num_derive::{FromPrimitive, ToPrimitive};

/// Error kinds surfaced to applications. These are terminal outcomes, never
/// exceptions: every task resolves to exactly one of these (or success).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[allow(non_camel_case_types)]
pub enum GattError {
    Success = 0,
    NullTarget,
    NotConnected,
    NoMatchingTarget,
    OperationNotSupported,
    TimedOut,
    RemoteGattFailure,
    CancelledFromDisconnect,
    CancelledFromBleTurningOff,
    FailedToToggleNotification,
    FailedToSetValueOnTarget,
    AndroidVersionNotSupported,
    Busy,
    AuthenticationFailed,
    InitializationFailed,
    BondFailed,
    ExplicitDisconnect,
    RogueDisconnect,
    DiscoveringResourcesFailed,
}

impl Default for GattError {
    fn default() -> Self {
        GattError::Success
    }
}

impl From<u32> for GattError {
    fn from(val: u32) -> Self {
        num_traits::FromPrimitive::from_u32(val).unwrap_or(GattError::OperationNotSupported)
    }
}

impl From<GattError> for u32 {
    fn from(val: GattError) -> Self {
        num_traits::ToPrimitive::to_u32(&val).unwrap_or(0)
    }
}

impl std::fmt::Display for GattError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl GattError {
    pub fn is_success(&self) -> bool {
        matches!(self, GattError::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_u32() {
        let e = GattError::BondFailed;
        let raw: u32 = e.into();
        assert_eq!(GattError::from(raw), GattError::BondFailed);
    }

    #[test]
    fn unknown_value_falls_back() {
        assert_eq!(GattError::from(9999u32), GattError::OperationNotSupported);
    }
}
