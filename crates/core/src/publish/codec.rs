use serde::Serialize;

use crate::colour::Rgb;
use crate::device::Protocol;
use crate::trigger::{CommandIntent, LightCommand, PowerState};
use crate::{Result, VisualiserError};

/// One topic/payload pair as it goes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl WireMessage {
    fn new(topic: String, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic,
            payload: payload.into(),
        }
    }

    /// Payload as text, for logs and tests.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

#[derive(Serialize)]
struct JsonCommand {
    state: PowerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    color: Option<Rgb>,
    #[serde(skip_serializing_if = "Option::is_none")]
    brightness: Option<u8>,
}

/// Encodes an intent for the device's protocol.
///
/// `Json` publishes one message on `<topic>/set`. `Scalar` publishes power,
/// colour and dimmer on separate topics; an off command only sets power.
pub fn encode(intent: &CommandIntent) -> Result<Vec<WireMessage>> {
    let base = intent.topic.trim_end_matches('/');
    if base.is_empty() {
        return Err(VisualiserError::InvalidInput("command topic is empty"));
    }
    if base.contains(['+', '#']) {
        return Err(VisualiserError::InvalidInput(
            "command topic must not contain wildcards",
        ));
    }

    match intent.protocol {
        Protocol::Json => encode_json(base, &intent.command),
        Protocol::Scalar => Ok(encode_scalar(base, &intent.command)),
    }
}

fn encode_json(base: &str, command: &LightCommand) -> Result<Vec<WireMessage>> {
    let body = if command.is_on() {
        JsonCommand {
            state: PowerState::On,
            color: Some(command.colour),
            brightness: Some(command.brightness),
        }
    } else {
        JsonCommand {
            state: PowerState::Off,
            color: None,
            brightness: None,
        }
    };
    let payload = serde_json::to_vec(&body)?;
    Ok(vec![WireMessage::new(format!("{base}/set"), payload)])
}

fn encode_scalar(base: &str, command: &LightCommand) -> Vec<WireMessage> {
    if !command.is_on() {
        return vec![WireMessage::new(format!("{base}/POWER"), "OFF")];
    }
    vec![
        WireMessage::new(format!("{base}/POWER"), "ON"),
        WireMessage::new(format!("{base}/Color"), command.colour.to_string()),
        WireMessage::new(
            format!("{base}/Dimmer"),
            dimmer_percent(command.brightness).to_string(),
        ),
    ]
}

/// Maps 0..=255 onto the 1..=100 dimmer scale.
fn dimmer_percent(brightness: u8) -> u8 {
    ((brightness as f32 / 255.0 * 100.0).round() as u8).clamp(1, 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(protocol: Protocol, command: LightCommand) -> CommandIntent {
        CommandIntent {
            device_id: "lamp".into(),
            topic: "zigbee2mqtt/lamp".into(),
            protocol,
            command,
            issued_at: 0.0,
        }
    }

    #[test]
    fn json_on_carries_colour_and_brightness() {
        let messages = encode(&intent(
            Protocol::Json,
            LightCommand::on(Rgb::new(255, 64, 0), 200),
        ))
        .unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "zigbee2mqtt/lamp/set");
        let body: serde_json::Value = serde_json::from_slice(&messages[0].payload).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "state": "ON",
                "color": {"r": 255, "g": 64, "b": 0},
                "brightness": 200
            })
        );
    }

    #[test]
    fn json_off_is_state_only() {
        let messages = encode(&intent(Protocol::Json, LightCommand::off())).unwrap();
        assert_eq!(messages[0].payload_str(), r#"{"state":"OFF"}"#);
    }

    #[test]
    fn scalar_on_uses_one_topic_per_attribute() {
        let mut on = intent(Protocol::Scalar, LightCommand::on(Rgb::new(10, 20, 30), 128));
        on.topic = "cmnd/tasmota_1/".into();
        let messages = encode(&on).unwrap();

        let pairs: Vec<(String, String)> = messages
            .iter()
            .map(|m| (m.topic.clone(), m.payload_str().into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("cmnd/tasmota_1/POWER".to_string(), "ON".to_string()),
                ("cmnd/tasmota_1/Color".to_string(), "10,20,30".to_string()),
                ("cmnd/tasmota_1/Dimmer".to_string(), "50".to_string()),
            ]
        );
    }

    #[test]
    fn scalar_off_only_sets_power() {
        let messages = encode(&intent(Protocol::Scalar, LightCommand::off())).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "zigbee2mqtt/lamp/POWER");
        assert_eq!(messages[0].payload_str(), "OFF");
    }

    #[test]
    fn dimmer_never_rounds_to_zero() {
        assert_eq!(dimmer_percent(1), 1);
        assert_eq!(dimmer_percent(255), 100);
    }

    #[test]
    fn bad_topics_are_rejected() {
        let mut bad = intent(Protocol::Json, LightCommand::off());
        bad.topic = "lights/+".into();
        assert!(encode(&bad).is_err());
        bad.topic = "/".into();
        assert!(encode(&bad).is_err());
    }
}
