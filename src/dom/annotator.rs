use crate::dom::document::{ElementId, PageDom};
use crate::dom::locator::{
    EVENT_SELECTORS, Strategy, TitleSelectors, event_elements, event_start, raw_title, strategies,
};
use crate::dom::selector::{SelectorError, SelectorList};
use crate::domain::models::{Settings, append_energy_suffix, parse_hour, strip_energy_suffix};
use crate::infrastructure::config::NowFallback;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, Timelike, Utc};
use std::sync::Arc;
use tracing::debug;

pub const GHOSTED_CLASS: &str = "ghosted-event";
pub const FUTURE_OPACITY: &str = "0.5";
pub const FUTURE_FILTER: &str = "grayscale(50%)";
const NOW_INDICATOR: &str = ".rGFpCd";
const ENERGY_CLASSES: [&str; 3] = ["low-energy", "neutral-energy", "high-energy"];

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Inline state a settings pass wants on one event element. `None` fields
/// are left as the page has them.
#[derive(Debug, Default, PartialEq, Eq)]
struct Desired {
    opacity: Option<Option<String>>,
    filter: Option<Option<String>>,
    pointer_events: Option<Option<String>>,
    display: Option<Option<String>>,
    ghosted: bool,
}

/// Applies settings to the page. Every pass recomputes the wanted look from
/// settings plus the current DOM, so running it twice changes nothing.
pub struct Annotator {
    events: Vec<Strategy>,
    selectors: TitleSelectors,
    now_indicator: SelectorList,
    offset: FixedOffset,
    fallback: NowFallback,
    clock: NowProvider,
}

impl Annotator {
    pub fn new() -> Result<Self, SelectorError> {
        Ok(Self {
            events: strategies(&EVENT_SELECTORS)?,
            selectors: TitleSelectors::standard()?,
            now_indicator: SelectorList::parse(NOW_INDICATOR)?,
            offset: Utc.fix(),
            fallback: NowFallback::WallClock,
            clock: Arc::new(Utc::now),
        })
    }

    pub fn with_clock(mut self, clock: NowProvider) -> Self {
        self.clock = clock;
        self
    }

    /// Offset of the page's local time; event hours are read in it.
    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_now_fallback(mut self, fallback: NowFallback) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn event_elements(&self, dom: &dyn PageDom) -> Vec<ElementId> {
        event_elements(dom, &self.events)
    }

    /// The page's live-time indicator when present, else the clock (or start of today).
    pub fn now_reference(&self, dom: &dyn PageDom) -> DateTime<Utc> {
        let indicated = dom
            .query_all(&self.now_indicator)
            .into_iter()
            .find_map(|element| dom.attribute(element, "data-time"))
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis);
        if let Some(now) = indicated {
            return now;
        }
        let now = (self.clock)();
        match self.fallback {
            NowFallback::WallClock => now,
            NowFallback::StartOfDay => now
                .with_timezone(&self.offset)
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .and_then(|midnight| midnight.and_local_timezone(self.offset).single())
                .map(|midnight| midnight.with_timezone(&Utc))
                .unwrap_or(now),
        }
    }

    fn event_time(&self, dom: &dyn PageDom, element: ElementId) -> Option<DateTime<FixedOffset>> {
        let raw = event_start(dom, element, &self.selectors)?;
        let parsed = parse_event_time(&raw, self.offset);
        if parsed.is_none() {
            debug!(value = %raw, "unparseable event time; leaving element untouched");
        }
        parsed
    }

    /// Dims events that start after now; clears the effect from the rest.
    pub fn apply_future_ghosting(&self, dom: &mut dyn PageDom, enabled: bool) {
        let now = self.now_reference(dom);
        for element in self.event_elements(dom) {
            let Some(start) = self.event_time(dom, element) else {
                continue;
            };
            if enabled && start.with_timezone(&Utc) > now {
                dom.set_style(element, "opacity", Some(FUTURE_OPACITY));
                dom.set_style(element, "filter", Some(FUTURE_FILTER));
            } else {
                dom.set_style(element, "opacity", None);
                dom.set_style(element, "filter", None);
            }
        }
    }

    /// Hides events starting before `until` (`HH:MM`). `None` leaves the page alone.
    pub fn hide_mornings(&self, dom: &mut dyn PageDom, until: Option<&str>) {
        let Some(hour) = until.and_then(parse_hour) else {
            return;
        };
        for element in self.event_elements(dom) {
            let Some(start) = self.event_time(dom, element) else {
                continue;
            };
            let display = (start.hour() < hour).then_some("none");
            dom.set_style(element, "display", display);
        }
    }

    /// Dims and disables events whose title is in `titles`; restores the rest.
    pub fn apply_event_ghosting(&self, dom: &mut dyn PageDom, titles: &[String], opacity: u8) {
        let value = opacity_value(opacity);
        for element in self.event_elements(dom) {
            let title = self.clean_title(dom, element);
            if titles.iter().any(|ghosted| *ghosted == title) {
                dom.set_style(element, "opacity", Some(&value));
                dom.set_style(element, "pointer-events", Some("none"));
                dom.add_class(element, GHOSTED_CLASS);
            } else if dom.has_class(element, GHOSTED_CLASS) {
                dom.set_style(element, "opacity", None);
                dom.set_style(element, "pointer-events", None);
                dom.remove_class(element, GHOSTED_CLASS);
            }
        }
    }

    /// Rewrites every event titled `title` to carry the energy suffix. Returns
    /// how many events were touched.
    pub fn apply_energy(&self, dom: &mut dyn PageDom, title: &str, energy: i32) -> usize {
        let target = strip_energy_suffix(title);
        let labelled = append_energy_suffix(&target, energy);
        let class = energy_class(energy);
        let mut touched = 0;
        for element in self.event_elements(dom) {
            if self.clean_title(dom, element) != target {
                continue;
            }
            for title_element in self.selectors.title_elements(dom, element) {
                if dom.attribute(title_element, "aria-label").is_some() {
                    dom.set_attribute(title_element, "aria-label", &labelled);
                }
                if dom.has_class(title_element, "FAxxKc") || dom.has_class(title_element, "r4nke") {
                    dom.set_text(title_element, &labelled);
                }
            }
            if dom.attribute(element, "title").is_some() {
                dom.set_attribute(element, "title", &labelled);
            }
            if dom.attribute(element, "aria-label").is_some() {
                dom.set_attribute(element, "aria-label", &labelled);
            }
            dom.set_attribute(element, "data-energy", &energy.to_string());
            for other in ENERGY_CLASSES.iter().filter(|other| **other != class) {
                dom.remove_class(element, other);
            }
            dom.add_class(element, class);
            touched += 1;
        }
        touched
    }

    /// Every settings-driven effect in one pass, writing only what differs.
    pub fn apply_settings(&self, dom: &mut dyn PageDom, settings: &Settings) {
        let now = self.now_reference(dom);
        let hide_hour = settings.hide_until_hour();
        let ghost_opacity = opacity_value(settings.ghost_event_opacity);

        for element in self.event_elements(dom) {
            let start = self.event_time(dom, element);
            let ghosted = settings.is_ghosted(&self.clean_title(dom, element));
            let was_ghosted = dom.has_class(element, GHOSTED_CLASS);
            let future = start.map(|start| settings.ghost_future_events && start.with_timezone(&Utc) > now);

            let mut desired = Desired {
                ghosted,
                ..Desired::default()
            };
            desired.opacity = match (ghosted, future) {
                (true, _) => Some(Some(ghost_opacity.clone())),
                (false, Some(true)) => Some(Some(FUTURE_OPACITY.to_string())),
                (false, Some(false)) => Some(None),
                (false, None) if was_ghosted => Some(None),
                (false, None) => None,
            };
            desired.filter = future.map(|future| future.then(|| FUTURE_FILTER.to_string()));
            desired.pointer_events = if ghosted {
                Some(Some("none".to_string()))
            } else if was_ghosted {
                Some(None)
            } else {
                None
            };
            desired.display = match (hide_hour, start) {
                (Some(hour), Some(start)) => {
                    Some((start.hour() < hour).then(|| "none".to_string()))
                }
                (None, Some(_)) => Some(None),
                (_, None) => None,
            };
            write_desired(dom, element, &desired);
        }
    }

    fn clean_title(&self, dom: &dyn PageDom, element: ElementId) -> String {
        strip_energy_suffix(&raw_title(dom, element, &self.selectors))
    }
}

fn write_desired(dom: &mut dyn PageDom, element: ElementId, desired: &Desired) {
    let styles = [
        ("opacity", &desired.opacity),
        ("filter", &desired.filter),
        ("pointer-events", &desired.pointer_events),
        ("display", &desired.display),
    ];
    for (property, value) in styles {
        if let Some(value) = value {
            dom.set_style(element, property, value.as_deref());
        }
    }
    if desired.ghosted {
        dom.add_class(element, GHOSTED_CLASS);
    } else {
        dom.remove_class(element, GHOSTED_CLASS);
    }
}

/// `0..=100` percent as a CSS opacity (`50` -> `"0.5"`, `100` -> `"1"`).
pub fn opacity_value(percent: u8) -> String {
    (f64::from(percent.min(100)) / 100.0).to_string()
}

pub fn energy_class(energy: i32) -> &'static str {
    match energy {
        value if value < 0 => ENERGY_CLASSES[0],
        0 => ENERGY_CLASSES[1],
        _ => ENERGY_CLASSES[2],
    }
}

/// Accepts RFC 3339 timestamps, local date-times and bare dates (local midnight).
pub fn parse_event_time(raw: &str, offset: FixedOffset) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&offset));
    }
    let naive = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })?;
    naive.and_local_timezone(offset).single()
}
