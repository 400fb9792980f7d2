//! # Shadow State Reactor
//!
//! Reacts to the desired section of the device shadow and to the torch
//! control topic.
//!
//! ```text
//! $aws/things/<thing>/shadow/get/accepted ──► decode_shadow ──► DeviceActuator
//! torch                                   ──► decode_torch  ──┘
//! ```
//!
//! The three desired fields are decoded independently: a missing or mistyped
//! field only fails its own action.

pub mod actuator;
pub mod reactor;

use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub use actuator::{ActuatorError, DeviceActuator, LocalActuator};
pub use reactor::ShadowReactor;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadDecodeError {
    #[error("Shadow document is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Desired field '{0}' is missing")]
    Missing(&'static str),

    #[error("Desired field '{0}' is not a string")]
    NotAString(&'static str),
}

/// Device action derived from one desired field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DesiredAction {
    TorchEnabled,
    TorchDisabled,
    OpenCamera,
    ShowAlert(String),
    None,
}

impl fmt::Display for DesiredAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DesiredAction::TorchEnabled => f.write_str("torch enabled"),
            DesiredAction::TorchDisabled => f.write_str("torch disabled"),
            DesiredAction::OpenCamera => f.write_str("camera opened"),
            DesiredAction::ShowAlert(message) => write!(f, "alert shown: {}", message),
            DesiredAction::None => f.write_str("no action"),
        }
    }
}

pub type FieldResult = Result<DesiredAction, PayloadDecodeError>;

/// Per-field decode results of one shadow document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowDecode {
    pub flashlight: FieldResult,
    pub camera: FieldResult,
    pub alert: FieldResult,
}

fn desired_str<'a>(desired: Option<&'a Value>, field: &'static str) -> Result<&'a str, PayloadDecodeError> {
    match desired.and_then(|d| d.get(field)) {
        None | Some(Value::Null) => Err(PayloadDecodeError::Missing(field)),
        Some(Value::String(value)) => Ok(value),
        Some(_) => Err(PayloadDecodeError::NotAString(field)),
    }
}

pub fn decode_shadow(payload: &[u8]) -> ShadowDecode {
    let document: Value = match serde_json::from_slice(payload) {
        Ok(document) => document,
        Err(e) => {
            let err = PayloadDecodeError::InvalidJson(e.to_string());
            return ShadowDecode {
                flashlight: Err(err.clone()),
                camera: Err(err.clone()),
                alert: Err(err),
            };
        }
    };
    let desired = document.pointer("/state/desired");

    let flashlight = desired_str(desired, "flashlight").map(|value| match value {
        "on" => DesiredAction::TorchEnabled,
        _ => DesiredAction::TorchDisabled,
    });

    let camera = desired_str(desired, "camera").map(|value| match value {
        "on" => DesiredAction::OpenCamera,
        _ => DesiredAction::None,
    });

    // The message is only required when the alert is switched on
    let alert = desired_str(desired, "alertmessage").and_then(|value| match value {
        "on" => desired_str(desired, "message")
            .map(|message| DesiredAction::ShowAlert(message.to_string())),
        _ => Ok(DesiredAction::None),
    });

    ShadowDecode {
        flashlight,
        camera,
        alert,
    }
}

/// Torch topic payload: the torch goes on when the leading number of the
/// payload is zero. Text without a leading number reads as zero too, so
/// `""`, `"abc"` and `"0abc"` all turn the torch on.
pub fn decode_torch(payload: &[u8]) -> bool {
    leading_number(&String::from_utf8_lossy(payload)) == 0.0
}

/// Value of the longest decimal prefix after leading whitespace, 0 when there
/// is none.
fn leading_number(text: &str) -> f32 {
    let text = text.trim_start();
    let bytes = text.as_bytes();
    let digits_from = |start: usize| {
        start
            + bytes
                .get(start..)
                .unwrap_or_default()
                .iter()
                .take_while(|b| b.is_ascii_digit())
                .count()
    };

    let sign_end = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    let int_end = digits_from(sign_end);
    let mut end = int_end;
    if bytes.get(int_end) == Some(&b'.') {
        let fraction_end = digits_from(int_end + 1);
        if fraction_end > int_end + 1 || int_end > sign_end {
            end = fraction_end;
        }
    }
    if end == sign_end {
        return 0.0;
    }

    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let exponent_sign = matches!(bytes.get(end + 1), Some(b'+' | b'-'));
        let exponent_start = end + 1 + usize::from(exponent_sign);
        let exponent_end = digits_from(exponent_start);
        if exponent_end > exponent_start {
            end = exponent_end;
        }
    }

    text[..end].parse().unwrap_or(0.0)
}

/// Payload published on the torch topic for the requested state.
pub fn encode_torch(on: bool) -> &'static str {
    if on {
        "0"
    } else {
        "1"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flashlight_on_enables_torch() {
        let decoded =
            decode_shadow(br#"{"state":{"desired":{"flashlight":"on","camera":"off","alertmessage":"off"}}}"#);
        assert_eq!(decoded.flashlight.as_ref().unwrap().to_string(), "torch enabled");
        assert_eq!(decoded.camera, Ok(DesiredAction::None));
        assert_eq!(decoded.alert, Ok(DesiredAction::None));
    }

    #[test]
    fn flashlight_off_disables_torch() {
        let decoded = decode_shadow(br#"{"state":{"desired":{"flashlight":"off"}}}"#);
        assert_eq!(decoded.flashlight.unwrap().to_string(), "torch disabled");
    }

    #[test]
    fn missing_flashlight_does_not_block_other_fields() {
        let decoded = decode_shadow(
            br#"{"state":{"desired":{"camera":"on","alertmessage":"on","message":"Battery low"}}}"#,
        );
        assert_eq!(
            decoded.flashlight,
            Err(PayloadDecodeError::Missing("flashlight"))
        );
        assert_eq!(decoded.camera, Ok(DesiredAction::OpenCamera));
        assert_eq!(
            decoded.alert,
            Ok(DesiredAction::ShowAlert("Battery low".to_string()))
        );
    }

    #[test]
    fn mistyped_fields_are_reported_per_field() {
        let decoded = decode_shadow(
            br#"{"state":{"desired":{"flashlight":1,"camera":"off","alertmessage":"on"}}}"#,
        );
        assert_eq!(
            decoded.flashlight,
            Err(PayloadDecodeError::NotAString("flashlight"))
        );
        assert_eq!(decoded.camera, Ok(DesiredAction::None));
        assert_eq!(decoded.alert, Err(PayloadDecodeError::Missing("message")));
    }

    #[test]
    fn invalid_json_fails_every_field() {
        let decoded = decode_shadow(b"not json");
        assert!(matches!(decoded.flashlight, Err(PayloadDecodeError::InvalidJson(_))));
        assert!(matches!(decoded.camera, Err(PayloadDecodeError::InvalidJson(_))));
        assert!(matches!(decoded.alert, Err(PayloadDecodeError::InvalidJson(_))));
    }

    #[test]
    fn torch_topic_zero_means_on() {
        assert!(decode_torch(b"0"));
        assert!(decode_torch(b" 0.0\n"));
        assert!(decode_torch(b"-0"));
        assert!(!decode_torch(b"1"));
        assert!(!decode_torch(b"0.5"));
        assert_eq!(encode_torch(true), "0");
        assert_eq!(encode_torch(false), "1");
    }

    #[test]
    fn torch_payload_without_leading_number_reads_as_zero() {
        assert!(decode_torch(b""));
        assert!(decode_torch(b"abc"));
        assert!(decode_torch(b"on"));
        assert!(decode_torch(b"0abc"));
        assert!(decode_torch(b"."));
        assert!(!decode_torch(b"1abc"));
        assert!(!decode_torch(b"  2.5e1 lux"));
        assert!(!decode_torch(b"-.5"));
    }
}
