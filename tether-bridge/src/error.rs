//! Bridge error taxonomy: permanent failures exit the supervisor loop,
//! everything else backs off and retries.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The very first credential fetch failed. By contract this is never
    /// retried; a broker that cannot serve the token at startup means
    /// the connection id is wrong or the broker is down.
    #[error("initial credential acquisition failed: {0}")]
    InitialAuth(String),
    #[error("credential refresh failed: {0}")]
    Refresh(String),
    #[error("authentication strategy is invalid: {0}")]
    Strategy(String),
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("read failed: {0}")]
    Read(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("no pong within the read deadline")]
    PingTimeout,
    #[error("server closed the connection with code {0}")]
    PermanentClose(u16),
    #[error("handler marked the disconnect fatal: {0}")]
    HandlerFatal(String),
    #[error("send on a closed connection")]
    Closed,
    #[error("outbound queue is full")]
    QueueFull,
}

impl BridgeError {
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            BridgeError::InitialAuth(_)
                | BridgeError::Strategy(_)
                | BridgeError::PermanentClose(_)
                | BridgeError::HandlerFatal(_)
        )
    }
}

/// Close codes whose semantics preclude reconnecting: normal closure,
/// invalid payload, policy violation and server internal error.
pub fn is_permanent_close_code(code: u16) -> bool {
    matches!(code, 1000 | 1007 | 1008 | 1011)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_splits_permanent_from_transient() {
        assert!(BridgeError::InitialAuth("down".into()).is_permanent());
        assert!(BridgeError::Strategy("no token".into()).is_permanent());
        assert!(BridgeError::PermanentClose(1008).is_permanent());
        assert!(BridgeError::HandlerFatal("bad subprotocol".into()).is_permanent());

        assert!(!BridgeError::Dial("refused".into()).is_permanent());
        assert!(!BridgeError::Read("reset".into()).is_permanent());
        assert!(!BridgeError::Write("broken pipe".into()).is_permanent());
        assert!(!BridgeError::PingTimeout.is_permanent());
        assert!(!BridgeError::Refresh("500".into()).is_permanent());
    }

    #[test]
    fn permanent_close_codes_are_exactly_the_four() {
        for code in [1000, 1007, 1008, 1011] {
            assert!(is_permanent_close_code(code), "code {}", code);
        }
        for code in [1001, 1002, 1006, 1012, 4000] {
            assert!(!is_permanent_close_code(code), "code {}", code);
        }
    }
}
