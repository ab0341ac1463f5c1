use chrono::NaiveTime;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;

pub const DEFAULT_GHOST_OPACITY: u8 = 50;
pub const MAX_GHOST_OPACITY: u8 = 100;

static ENERGY_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:🔋|⚡|⚖️?)\s*\(([+-]?\d+)\)").expect("energy suffix pattern is valid")
});

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub ghost_future_events: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hide_until_time: Option<String>,
    #[serde(default, deserialize_with = "deserialize_ghosted_events")]
    pub ghosted_events: Vec<String>,
    #[serde(
        default = "default_ghost_opacity",
        deserialize_with = "deserialize_opacity"
    )]
    pub ghost_event_opacity: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ghost_future_events: false,
            hide_until_time: None,
            ghosted_events: Vec::new(),
            ghost_event_opacity: DEFAULT_GHOST_OPACITY,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(until) = self.hide_until_time.as_deref() {
            validate_hhmm(until, "settings.hide_until_time")?;
        }
        if self.ghost_event_opacity > MAX_GHOST_OPACITY {
            return Err("settings.ghost_event_opacity must be <= 100".to_string());
        }
        let mut seen = HashSet::new();
        for title in &self.ghosted_events {
            if !seen.insert(title.as_str()) {
                return Err(format!("settings.ghosted_events contains duplicate '{title}'"));
            }
        }
        Ok(())
    }

    /// Brings a caller-composed settings object back inside its invariants.
    pub fn normalized(mut self) -> Self {
        self.ghost_event_opacity = self.ghost_event_opacity.min(MAX_GHOST_OPACITY);
        self.ghosted_events = dedup_titles(self.ghosted_events);
        self.hide_until_time = self
            .hide_until_time
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        self
    }

    pub fn is_ghosted(&self, title: &str) -> bool {
        self.ghosted_events.iter().any(|ghosted| ghosted == title)
    }

    /// Adds the title when absent, removes it when present. Remaining titles keep their order.
    pub fn with_toggled_ghost(&self, title: &str) -> Settings {
        let mut next = self.clone();
        if self.is_ghosted(title) {
            next.ghosted_events.retain(|ghosted| ghosted != title);
        } else {
            next.ghosted_events.push(title.to_string());
        }
        next
    }

    pub fn hide_until_hour(&self) -> Option<u32> {
        self.hide_until_time.as_deref().and_then(parse_hour)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionState {
    #[serde(default)]
    pub is_authorized: bool,
    #[serde(default)]
    pub dark_mode: bool,
    #[serde(default)]
    pub selected_event: Option<CalendarEvent>,
    #[serde(default)]
    pub settings: Settings,
}

/// Partial update of [`ExtensionState`]. Top-level keys merge shallowly; `settings`
/// replaces the whole settings object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StatePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_authorized: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dark_mode: Option<bool>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    pub selected_event: Option<Option<CalendarEvent>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Settings>,
}

impl StatePatch {
    pub fn settings(settings: Settings) -> Self {
        Self {
            settings: Some(settings),
            ..Self::default()
        }
    }

    pub fn selected_event(event: Option<CalendarEvent>) -> Self {
        Self {
            selected_event: Some(event),
            ..Self::default()
        }
    }

    pub fn authorized(is_authorized: bool) -> Self {
        Self {
            is_authorized: Some(is_authorized),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.is_authorized.is_none()
            && self.dark_mode.is_none()
            && self.selected_event.is_none()
            && self.settings.is_none()
    }

    pub fn apply_to(&self, state: &ExtensionState) -> ExtensionState {
        ExtensionState {
            is_authorized: self.is_authorized.unwrap_or(state.is_authorized),
            dark_mode: self.dark_mode.unwrap_or(state.dark_mode),
            selected_event: match &self.selected_event {
                Some(event) => event.clone(),
                None => state.selected_event.clone(),
            },
            settings: match &self.settings {
                Some(settings) => settings.clone().normalized(),
                None => state.settings.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnergyLevel {
    pub value: i32,
    pub text: &'static str,
}

pub const QUICK_ENERGY_LEVELS: [EnergyLevel; 5] = [
    EnergyLevel { value: -4, text: "Very Draining" },
    EnergyLevel { value: -2, text: "Draining" },
    EnergyLevel { value: 0, text: "Neutral" },
    EnergyLevel { value: 2, text: "Energizing" },
    EnergyLevel { value: 4, text: "Very Energizing" },
];

impl EnergyLevel {
    pub fn label(&self) -> String {
        format!("{} {} {}", energy_emoji(self.value), self.text, signed(self.value))
    }
}

pub fn energy_emoji(energy: i32) -> &'static str {
    match energy {
        value if value < 0 => "🔋",
        value if value > 0 => "⚡",
        _ => "⚖️",
    }
}

pub fn energy_suffix(energy: i32) -> String {
    format!("{} {}", energy_emoji(energy), signed(energy))
}

fn signed(energy: i32) -> String {
    if energy > 0 {
        format!("(+{energy})")
    } else {
        format!("({energy})")
    }
}

pub fn strip_energy_suffix(title: &str) -> String {
    ENERGY_SUFFIX.replace(title, "").trim().to_string()
}

pub fn parse_energy_suffix(title: &str) -> Option<i32> {
    ENERGY_SUFFIX
        .captures(title)
        .and_then(|captures| captures.get(1))
        .and_then(|value| value.as_str().parse::<i32>().ok())
}

pub fn append_energy_suffix(title: &str, energy: i32) -> String {
    let clean = strip_energy_suffix(title);
    if clean.is_empty() {
        return energy_suffix(energy);
    }
    format!("{clean} {}", energy_suffix(energy))
}

pub fn validate_hhmm(value: &str, field_name: &str) -> Result<(), String> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map(|_| ())
        .map_err(|_| format!("{field_name} must be HH:MM"))
}

/// Hour component of an `HH:MM` value. Lenient on the minute part.
pub fn parse_hour(value: &str) -> Option<u32> {
    let hour = value.trim().split(':').next()?.trim().parse::<u32>().ok()?;
    (hour <= 23).then_some(hour)
}

pub fn dedup_titles(titles: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    titles
        .into_iter()
        .filter(|title| seen.insert(title.clone()))
        .collect()
}

fn default_ghost_opacity() -> u8 {
    DEFAULT_GHOST_OPACITY
}

fn deserialize_opacity<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = f64::deserialize(deserializer)?;
    if raw.is_nan() {
        return Ok(DEFAULT_GHOST_OPACITY);
    }
    Ok(raw.round().clamp(0.0, f64::from(MAX_GHOST_OPACITY)) as u8)
}

fn deserialize_ghosted_events<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let titles = Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(dedup_titles(titles))
}

fn deserialize_present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
