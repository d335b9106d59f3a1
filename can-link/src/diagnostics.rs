//! UDS requests used to silence the EyeSight camera ECU
//!
//! Only the two-step handshake is covered: enter the extended diagnostic
//! session, then disable normal communication.

use std::time::Duration;

/// ECU physical request address
pub const EYESIGHT_ECU_ADDRESS: u32 = 0x787;
/// ISO-TP identifier the tester listens on
pub const DEFAULT_ISOTP_RX_ID: u32 = 0x78F;
/// ISO-TP identifier the tester transmits on
pub const DEFAULT_ISOTP_TX_ID: u32 = EYESIGHT_ECU_ADDRESS;

/// DiagnosticSessionControl, extended session
pub const DIAGNOSTIC_SESSION_REQUEST: [u8; 2] = [0x10, 0x03];
/// Positive response to `DIAGNOSTIC_SESSION_REQUEST`
pub const DIAGNOSTIC_SESSION_RESPONSE: [u8; 2] = [0x50, 0x03];
/// CommunicationControl: disable rx and tx, normal messages, no response
pub const COMMUNICATION_DISABLE_REQUEST: [u8; 3] = [0x28, 0x83, 0x01];

/// NRC 0x78, requestCorrectlyReceived-ResponsePending
pub const RESPONSE_PENDING: u8 = 0x78;

pub const DEFAULT_DISABLE_RETRIES: u32 = 10;
pub const DEFAULT_DISABLE_TIMEOUT: Duration = Duration::from_millis(100);
/// Pause before each handshake attempt
pub const DISABLE_ATTEMPT_DELAY: Duration = Duration::from_millis(100);

/// How a response to the session request is handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionResponse {
    /// `50 03`: session established
    Positive,
    /// Third byte is `0x78`: the ECU is still working on it
    Pending,
    /// Anything else
    Unexpected(Vec<u8>),
}

impl SessionResponse {
    pub fn classify(response: &[u8]) -> Self {
        if response.starts_with(&DIAGNOSTIC_SESSION_RESPONSE) {
            SessionResponse::Positive
        } else if response.get(2) == Some(&RESPONSE_PENDING) {
            SessionResponse::Pending
        } else {
            SessionResponse::Unexpected(response.to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(SessionResponse::classify(&[0x50, 0x03, 0x00, 0x32]), SessionResponse::Positive);
        assert_eq!(SessionResponse::classify(&[0x50, 0x03]), SessionResponse::Positive);
        assert_eq!(SessionResponse::classify(&[0x7F, 0x10, 0x78]), SessionResponse::Pending);
        assert_eq!(
            SessionResponse::classify(&[0x7F, 0x10, 0x22]),
            SessionResponse::Unexpected(vec![0x7F, 0x10, 0x22])
        );
        assert_eq!(SessionResponse::classify(&[]), SessionResponse::Unexpected(vec![]));
    }
}
