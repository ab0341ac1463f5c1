use crate::domain::models::{append_energy_suffix, parse_energy_suffix, strip_energy_suffix};
use serde_json::{Map, Value};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Default)]
pub struct CalendarEventDateTime {
    #[serde(rename = "dateTime", default, skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(rename = "timeZone", default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

/// Calendar API event resource. Fields this crate does not model are kept in
/// `extra` so a full replace (PUT) sends them back untouched.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Default)]
pub struct GoogleCalendarEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub start: CalendarEventDateTime,
    #[serde(default)]
    pub end: CalendarEventDateTime,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GoogleCalendarEvent {
    pub fn title(&self) -> &str {
        self.summary.as_deref().unwrap_or_default()
    }

    pub fn with_summary(&self, summary: impl Into<String>) -> GoogleCalendarEvent {
        let mut next = self.clone();
        next.summary = Some(summary.into());
        next
    }

    pub fn energy(&self) -> Option<i32> {
        parse_energy_suffix(self.title())
    }

    /// Summary with any prior energy suffix replaced by the one for `energy`.
    pub fn energy_title(&self, energy: i32) -> String {
        append_energy_suffix(self.title(), energy)
    }

    pub fn clean_title(&self) -> String {
        strip_energy_suffix(self.title())
    }
}

/// The calendar id encoded in front of a page event id (`<calendar>_<event>`).
pub fn calendar_id_from_event_id(event_id: &str) -> Option<String> {
    event_id
        .split('_')
        .next()
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() < event_id.trim().len())
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_survive_roundtrip() {
        let raw = serde_json::json!({
            "id": "evt-1",
            "summary": "Planning ⚡ (+2)",
            "start": { "dateTime": "2026-02-16T09:00:00Z" },
            "end": { "dateTime": "2026-02-16T10:00:00Z", "timeZone": "UTC" },
            "etag": "\"3181\"",
            "attendees": [{ "email": "a@example.com" }]
        });
        let event: GoogleCalendarEvent = serde_json::from_value(raw.clone()).expect("event");

        assert_eq!(event.energy(), Some(2));
        assert_eq!(event.clean_title(), "Planning");
        assert_eq!(event.extra.get("etag"), Some(&serde_json::json!("\"3181\"")));
        assert_eq!(serde_json::to_value(&event).expect("serialize"), raw);
    }

    #[test]
    fn energy_title_replaces_prior_suffix() {
        let event = GoogleCalendarEvent {
            summary: Some("Planning ⚡ (+2)".to_string()),
            ..GoogleCalendarEvent::default()
        };
        assert_eq!(event.energy_title(-3), "Planning 🔋 (-3)");
    }

    #[test]
    fn calendar_id_is_prefix_before_underscore() {
        assert_eq!(
            calendar_id_from_event_id("primary_abc123"),
            Some("primary".to_string())
        );
        assert_eq!(calendar_id_from_event_id("abc123"), None);
        assert_eq!(calendar_id_from_event_id("_abc"), None);
    }
}
