use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

pub const UNKNOWN_MESSAGE_TYPE: &str = "Unknown message type";

/// Cross-context message kinds. Wire names are the SCREAMING_SNAKE strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    GetState,
    UpdateState,
    AuthRequired,
    ToggleGhost,
    ToggleEventGhost,
    UpdateGhostOpacity,
    HideMornings,
    InitGapi,
    UpdateEventEnergy,
    OpenCalendar,
    Ping,
    Unknown(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::GetState => "GET_STATE",
            Self::UpdateState => "UPDATE_STATE",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::ToggleGhost => "TOGGLE_GHOST",
            Self::ToggleEventGhost => "TOGGLE_EVENT_GHOST",
            Self::UpdateGhostOpacity => "UPDATE_GHOST_OPACITY",
            Self::HideMornings => "HIDE_MORNINGS",
            Self::InitGapi => "INIT_GAPI",
            Self::UpdateEventEnergy => "UPDATE_EVENT_ENERGY",
            Self::OpenCalendar => "OPEN_GOOGLE_CALENDAR",
            Self::Ping => "PING",
            Self::Unknown(value) => value.as_str(),
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "GET_STATE" => Self::GetState,
            "UPDATE_STATE" => Self::UpdateState,
            "AUTH_REQUIRED" => Self::AuthRequired,
            "TOGGLE_GHOST" => Self::ToggleGhost,
            "TOGGLE_EVENT_GHOST" => Self::ToggleEventGhost,
            "UPDATE_GHOST_OPACITY" => Self::UpdateGhostOpacity,
            "HIDE_MORNINGS" => Self::HideMornings,
            "INIT_GAPI" => Self::InitGapi,
            "UPDATE_EVENT_ENERGY" => Self::UpdateEventEnergy,
            "OPEN_GOOGLE_CALENDAR" | "openGoogleCalendar" => Self::OpenCalendar,
            // liveness checks may use the lowercase form
            "PING" | "ping" => Self::Ping,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Message {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            payload: None,
        }
    }

    pub fn with_payload<T: Serialize>(kind: MessageType, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind,
            payload: Some(serde_json::to_value(payload)?),
        })
    }

    /// Decodes the payload, treating a missing payload as JSON `null`.
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, String> {
        let value = self.payload.clone().unwrap_or(Value::Null);
        serde_json::from_value(value)
            .map_err(|error| format!("invalid {} payload: {error}", self.kind.as_str()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MessageResponse {
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn unknown_type() -> Self {
        Self::failure(UNKNOWN_MESSAGE_TYPE)
    }

    pub fn into_result(self) -> Result<Option<Value>, String> {
        if self.success {
            Ok(self.data)
        } else {
            Err(self.error.unwrap_or_else(|| "Unknown error".to_string()))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToggleEventGhostPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_title: Option<String>,
    #[serde(default, alias = "eventTitles", skip_serializing_if = "Option::is_none")]
    pub titles: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opacity: Option<u8>,
}

impl ToggleEventGhostPayload {
    pub fn toggle(event_title: impl Into<String>) -> Self {
        Self {
            event_title: Some(event_title.into()),
            ..Self::default()
        }
    }

    pub fn render(titles: Vec<String>, opacity: u8) -> Self {
        Self {
            event_title: None,
            titles: Some(titles),
            opacity: Some(opacity),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InitGapiPayload {
    pub client_id: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEventEnergyPayload {
    pub event_title: String,
    pub energy: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}
