use crate::dom::document::{ElementId, PageDom};
use crate::dom::selector::{SelectorError, SelectorList};
use crate::domain::models::{CalendarEvent, parse_energy_suffix, strip_energy_suffix};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub const SELECTED_EVENT_SELECTORS: [&str; 3] = [
    r#"[data-eventid][aria-selected="true"]"#,
    r#"[role="gridcell"] [role="button"][aria-selected="true"]"#,
    r#".Jmftzc.gVNoLb.EiZ8Dd[aria-selected="true"]"#,
];

pub const EVENT_SELECTORS: [&str; 3] = [
    "[data-eventid]",
    r#"[role="gridcell"] [role="button"]"#,
    ".Jmftzc.gVNoLb.EiZ8Dd",
];

const TITLE_SELECTORS: [&str; 3] = [".FAxxKc", ".r4nke", "[aria-label]"];
const TIME_SELECTOR: &str = "time[datetime]";
const START_TIME_SELECTOR: &str = "[data-start-time]";

pub type Extractor = fn(&dyn PageDom, ElementId, &TitleSelectors) -> Option<CalendarEvent>;

/// One way of finding events on the page. Strategies are tried in order.
#[derive(Debug, Clone)]
pub struct Strategy {
    pub selector: SelectorList,
    pub extract: Extractor,
}

impl Strategy {
    pub fn parse(selector: &str) -> Result<Self, SelectorError> {
        Ok(Self {
            selector: SelectorList::parse(selector)?,
            extract: extract_event,
        })
    }
}

/// Title element selectors, most specific first.
#[derive(Debug, Clone)]
pub struct TitleSelectors {
    title: Vec<SelectorList>,
    time: SelectorList,
    start_time: SelectorList,
}

impl TitleSelectors {
    pub fn standard() -> Result<Self, SelectorError> {
        Ok(Self {
            title: TITLE_SELECTORS
                .iter()
                .map(|source| SelectorList::parse(source))
                .collect::<Result<_, _>>()?,
            time: SelectorList::parse(TIME_SELECTOR)?,
            start_time: SelectorList::parse(START_TIME_SELECTOR)?,
        })
    }

    /// First title-bearing descendant of `element`.
    pub fn title_element(&self, dom: &dyn PageDom, element: ElementId) -> Option<ElementId> {
        self.title
            .iter()
            .find_map(|selector| dom.query_first(element, selector))
    }

    pub fn title_elements(&self, dom: &dyn PageDom, element: ElementId) -> Vec<ElementId> {
        let mut found = Vec::new();
        for selector in &self.title {
            for candidate in dom.query_within(element, selector) {
                if !found.contains(&candidate) {
                    found.push(candidate);
                }
            }
        }
        found
    }
}

pub fn strategies(sources: &[&str]) -> Result<Vec<Strategy>, SelectorError> {
    sources.iter().map(|source| Strategy::parse(source)).collect()
}

/// Raw displayed title: `title` attribute, then title descendants, then own text.
pub fn raw_title(dom: &dyn PageDom, element: ElementId, selectors: &TitleSelectors) -> String {
    if let Some(title) = dom
        .attribute(element, "title")
        .filter(|title| !title.trim().is_empty())
    {
        return title;
    }
    if let Some(title_element) = selectors.title_element(dom, element) {
        let text = dom.text(title_element);
        if !text.trim().is_empty() {
            return text;
        }
        if let Some(label) = dom.attribute(title_element, "aria-label") {
            return label;
        }
    }
    dom.text(element)
}

/// `None` when the element shows no title once the energy suffix is gone.
pub fn extract_event(
    dom: &dyn PageDom,
    element: ElementId,
    selectors: &TitleSelectors,
) -> Option<CalendarEvent> {
    let raw = raw_title(dom, element, selectors);
    let title = strip_energy_suffix(&raw);
    if title.is_empty() {
        return None;
    }
    let id = dom
        .attribute(element, "data-eventid")
        .or_else(|| dom.attribute(element, "data-key"))
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let start_time = event_start(dom, element, selectors).unwrap_or_default();
    let end_time = dom
        .query_first(element, &selectors.start_time)
        .and_then(|time| dom.attribute(time, "data-end-time"))
        .unwrap_or_else(|| start_time.clone());

    Some(CalendarEvent {
        id,
        title,
        start_time,
        end_time,
        energy: parse_energy_suffix(&raw),
    })
}

/// Start time string of an event element, if it carries one.
pub fn event_start(dom: &dyn PageDom, element: ElementId, selectors: &TitleSelectors) -> Option<String> {
    dom.query_first(element, &selectors.time)
        .and_then(|time| dom.attribute(time, "datetime"))
        .or_else(|| {
            dom.query_first(element, &selectors.start_time)
                .and_then(|time| dom.attribute(time, "data-start-time"))
        })
        .filter(|value| !value.trim().is_empty())
}

/// Every element any strategy matches, deduplicated, strategy order then document order.
pub fn event_elements(dom: &dyn PageDom, strategies: &[Strategy]) -> Vec<ElementId> {
    let mut elements = Vec::new();
    for strategy in strategies {
        for element in dom.query_all(&strategy.selector) {
            if !elements.contains(&element) {
                elements.push(element);
            }
        }
    }
    elements
}

#[derive(Debug, Clone, Copy)]
struct CachedElement {
    element: ElementId,
    version: u64,
    stored_at: Instant,
}

/// Finds the selected event. Hits are cached per selector for a short TTL
/// and dropped as soon as the page mutates.
#[derive(Debug)]
pub struct EventLocator {
    selected: Vec<Strategy>,
    selectors: TitleSelectors,
    ttl: Duration,
    cache: HashMap<String, CachedElement>,
}

impl EventLocator {
    pub fn new(ttl: Duration) -> Result<Self, SelectorError> {
        Ok(Self {
            selected: strategies(&SELECTED_EVENT_SELECTORS)?,
            selectors: TitleSelectors::standard()?,
            ttl,
            cache: HashMap::new(),
        })
    }

    pub fn with_strategies(mut self, selected: Vec<Strategy>) -> Self {
        self.selected = selected;
        self.cache.clear();
        self
    }

    pub fn title_selectors(&self) -> &TitleSelectors {
        &self.selectors
    }

    pub fn invalidate(&mut self) {
        self.cache.clear();
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// The selected event, or `None` when no strategy finds one.
    pub fn locate_selected(&mut self, dom: &dyn PageDom) -> Option<CalendarEvent> {
        let version = dom.mutation_version();
        for index in 0..self.selected.len() {
            let Some(element) = self.find(dom, index, version) else {
                continue;
            };
            let strategy = &self.selected[index];
            match (strategy.extract)(dom, element, &self.selectors) {
                Some(event) => return Some(event),
                None => debug!(selector = %strategy.selector, "strategy matched but extraction failed"),
            }
        }
        None
    }

    fn find(&mut self, dom: &dyn PageDom, index: usize, version: u64) -> Option<ElementId> {
        let key = self.selected[index].selector.as_str().to_string();
        if let Some(cached) = self.cache.get(&key) {
            if cached.version == version
                && cached.stored_at.elapsed() < self.ttl
                && dom.is_connected(cached.element)
            {
                return Some(cached.element);
            }
            self.cache.remove(&key);
        }

        let element = dom.query_all(&self.selected[index].selector).into_iter().next()?;
        self.cache.insert(
            key,
            CachedElement {
                element,
                version,
                stored_at: Instant::now(),
            },
        );
        Some(element)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::document::{Document, ElementBuilder};

    fn locator() -> EventLocator {
        EventLocator::new(Duration::from_millis(5_000)).expect("locator")
    }

    fn selected_event(id: &str, title: &str) -> ElementBuilder {
        ElementBuilder::new("div")
            .attr("data-eventid", id)
            .attr("aria-selected", "true")
            .child(ElementBuilder::new("span").class("FAxxKc").text(title))
            .child(ElementBuilder::new("time").attr("datetime", "2026-02-16T09:00:00Z"))
    }

    #[test]
    fn locates_selected_event_by_event_id() {
        let mut doc = Document::new();
        doc.append(doc.body(), selected_event("primary_abc", "Standup ⚡ (+2)"));

        let event = locator().locate_selected(&doc).expect("selected event");
        assert_eq!(event.id, "primary_abc");
        assert_eq!(event.title, "Standup");
        assert_eq!(event.energy, Some(2));
        assert_eq!(event.start_time, "2026-02-16T09:00:00Z");
        assert_eq!(event.end_time, event.start_time);
    }

    #[test]
    fn falls_through_to_grid_strategy_with_generated_id() {
        let mut doc = Document::new();
        let cell = doc.append(doc.body(), ElementBuilder::new("div").attr("role", "gridcell"));
        doc.append(
            cell,
            ElementBuilder::new("div")
                .attr("role", "button")
                .attr("aria-selected", "true")
                .attr("title", "1:1 with Sam")
                .child(
                    ElementBuilder::new("span")
                        .attr("data-start-time", "2026-02-16T15:00:00Z")
                        .attr("data-end-time", "2026-02-16T15:30:00Z"),
                ),
        );

        let event = locator().locate_selected(&doc).expect("selected event");
        assert_eq!(event.title, "1:1 with Sam");
        assert_eq!(event.start_time, "2026-02-16T15:00:00Z");
        assert_eq!(event.end_time, "2026-02-16T15:30:00Z");
        assert!(uuid::Uuid::parse_str(&event.id).is_ok());
    }

    #[test]
    fn nothing_selected_is_none() {
        let mut doc = Document::new();
        doc.append(
            doc.body(),
            ElementBuilder::new("div").attr("data-eventid", "unselected"),
        );
        assert_eq!(locator().locate_selected(&doc), None);
    }

    #[test]
    fn untitled_selection_falls_through_to_next_strategy() {
        let mut doc = Document::new();
        doc.append(
            doc.body(),
            ElementBuilder::new("div")
                .attr("data-eventid", "blank")
                .attr("aria-selected", "true"),
        );
        let cell = doc.append(doc.body(), ElementBuilder::new("div").attr("role", "gridcell"));
        doc.append(
            cell,
            ElementBuilder::new("div")
                .attr("role", "button")
                .attr("aria-selected", "true")
                .attr("title", "Retro"),
        );

        let event = locator().locate_selected(&doc).expect("selected event");
        assert_eq!(event.title, "Retro");
    }

    #[test]
    fn cache_is_dropped_when_page_mutates() {
        let mut doc = Document::new();
        let first = doc.append(doc.body(), selected_event("first", "Standup"));
        let mut locator = locator();
        assert_eq!(locator.locate_selected(&doc).map(|e| e.id), Some("first".to_string()));
        assert_eq!(locator.cached_len(), 1);

        doc.set_attribute(first, "aria-selected", "false");
        doc.append(doc.body(), selected_event("second", "Retro"));
        assert_eq!(locator.locate_selected(&doc).map(|e| e.id), Some("second".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn cache_entries_expire_after_ttl() {
        let mut doc = Document::new();
        doc.append(doc.body(), selected_event("first", "Standup"));
        let mut locator = EventLocator::new(Duration::from_millis(100)).expect("locator");
        locator.locate_selected(&doc);
        let cached_at = locator.cache.values().next().map(|entry| entry.stored_at);

        tokio::time::advance(Duration::from_millis(150)).await;
        locator.locate_selected(&doc);
        let refreshed_at = locator.cache.values().next().map(|entry| entry.stored_at);
        assert_ne!(cached_at, refreshed_at);
    }

    #[test]
    fn event_elements_are_deduplicated_across_strategies() {
        let mut doc = Document::new();
        let cell = doc.append(doc.body(), ElementBuilder::new("div").attr("role", "gridcell"));
        let both = doc.append(
            cell,
            ElementBuilder::new("div")
                .attr("role", "button")
                .attr("data-eventid", "x"),
        );
        let only_grid = doc.append(cell, ElementBuilder::new("div").attr("role", "button"));

        let found = event_elements(&doc, &strategies(&EVENT_SELECTORS).expect("strategies"));
        assert_eq!(found, vec![both, only_grid]);
    }
}
