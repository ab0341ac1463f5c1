use crate::dom::selector::{SelectorList, SelectorTarget};
use std::collections::BTreeMap;

pub type ElementId = usize;

/// The page surface the locator and annotator work against. Writes that do
/// not change a value must not bump `mutation_version`.
pub trait PageDom: Send {
    fn root(&self) -> ElementId;

    /// Connected elements under `root` (excluding it) matching `selector`, in document order.
    fn query_within(&self, root: ElementId, selector: &SelectorList) -> Vec<ElementId>;

    fn query_all(&self, selector: &SelectorList) -> Vec<ElementId> {
        self.query_within(self.root(), selector)
    }

    fn query_first(&self, root: ElementId, selector: &SelectorList) -> Option<ElementId> {
        self.query_within(root, selector).into_iter().next()
    }

    fn is_connected(&self, element: ElementId) -> bool;

    fn attribute(&self, element: ElementId, name: &str) -> Option<String>;
    fn set_attribute(&mut self, element: ElementId, name: &str, value: &str);

    /// Concatenated text of the element and its descendants.
    fn text(&self, element: ElementId) -> String;
    /// Replaces the element's children with a single text run.
    fn set_text(&mut self, element: ElementId, text: &str);

    fn style(&self, element: ElementId, property: &str) -> Option<String>;
    /// `None` removes the inline property.
    fn set_style(&mut self, element: ElementId, property: &str, value: Option<&str>);

    fn has_class(&self, element: ElementId, class: &str) -> bool;
    fn add_class(&mut self, element: ElementId, class: &str);
    fn remove_class(&mut self, element: ElementId, class: &str);

    fn mutation_version(&self) -> u64;
}

#[derive(Debug, Clone)]
struct Node {
    tag: String,
    attributes: BTreeMap<String, String>,
    classes: Vec<String>,
    style: BTreeMap<String, String>,
    text: String,
    parent: Option<ElementId>,
    children: Vec<ElementId>,
    connected: bool,
}

/// Element description used to grow a [`Document`].
#[derive(Debug, Clone, Default)]
pub struct ElementBuilder {
    tag: String,
    attributes: BTreeMap<String, String>,
    classes: Vec<String>,
    style: BTreeMap<String, String>,
    text: String,
    children: Vec<ElementBuilder>,
}

impl ElementBuilder {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        if name == "class" {
            self.classes = split_classes(&value);
        } else {
            self.attributes.insert(name, value);
        }
        self
    }

    pub fn class(mut self, class: impl Into<String>) -> Self {
        let class = class.into();
        if !self.classes.contains(&class) {
            self.classes.push(class);
        }
        self
    }

    pub fn style(mut self, property: impl Into<String>, value: impl Into<String>) -> Self {
        self.style.insert(property.into(), value.into());
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn child(mut self, child: ElementBuilder) -> Self {
        self.children.push(child);
        self
    }
}

/// Arena-backed page model. Element ids stay valid after removal; removed
/// subtrees report `is_connected == false`.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
    version: u64,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                tag: "body".to_string(),
                attributes: BTreeMap::new(),
                classes: Vec::new(),
                style: BTreeMap::new(),
                text: String::new(),
                parent: None,
                children: Vec::new(),
                connected: true,
            }],
            version: 0,
        }
    }

    pub fn body(&self) -> ElementId {
        0
    }

    /// Appends the element (and its children) under `parent`; returns the new element id.
    pub fn append(&mut self, parent: ElementId, element: ElementBuilder) -> ElementId {
        let id = self.insert(parent, element);
        self.version += 1;
        id
    }

    fn insert(&mut self, parent: ElementId, element: ElementBuilder) -> ElementId {
        let id = self.nodes.len();
        let connected = self.nodes.get(parent).is_some_and(|node| node.connected);
        self.nodes.push(Node {
            tag: element.tag,
            attributes: element.attributes,
            classes: element.classes,
            style: element.style,
            text: element.text,
            parent: Some(parent),
            children: Vec::new(),
            connected,
        });
        if let Some(node) = self.nodes.get_mut(parent) {
            node.children.push(id);
        }
        for child in element.children {
            self.insert(id, child);
        }
        id
    }

    pub fn remove(&mut self, element: ElementId) {
        if element == self.body() || !self.is_connected(element) {
            return;
        }
        if let Some(parent) = self.nodes[element].parent {
            self.nodes[parent].children.retain(|child| *child != element);
        }
        self.disconnect(element);
        self.version += 1;
    }

    fn disconnect(&mut self, element: ElementId) {
        let mut stack = vec![element];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get_mut(current) {
                node.connected = false;
                stack.extend(node.children.iter().copied());
            }
        }
    }

    pub fn tag(&self, element: ElementId) -> Option<&str> {
        self.nodes.get(element).map(|node| node.tag.as_str())
    }

    fn descendants(&self, root: ElementId) -> Vec<ElementId> {
        let mut ordered = Vec::new();
        let mut stack: Vec<ElementId> = match self.nodes.get(root) {
            Some(node) => node.children.iter().rev().copied().collect(),
            None => return ordered,
        };
        while let Some(current) = stack.pop() {
            ordered.push(current);
            stack.extend(self.nodes[current].children.iter().rev().copied());
        }
        ordered
    }

    fn node_mut(&mut self, element: ElementId) -> Option<&mut Node> {
        self.nodes.get_mut(element)
    }
}

impl SelectorTarget for Document {
    type Node = ElementId;

    fn tag_name(&self, node: ElementId) -> Option<&str> {
        self.tag(node)
    }

    fn matches_class(&self, node: ElementId, class: &str) -> bool {
        self.nodes
            .get(node)
            .is_some_and(|node| node.classes.iter().any(|candidate| candidate == class))
    }

    fn attribute_value(&self, node: ElementId, name: &str) -> Option<&str> {
        self.nodes
            .get(node)
            .and_then(|node| node.attributes.get(name))
            .map(String::as_str)
    }

    fn parent_node(&self, node: ElementId) -> Option<ElementId> {
        self.nodes.get(node).and_then(|node| node.parent)
    }
}

impl PageDom for Document {
    fn root(&self) -> ElementId {
        self.body()
    }

    fn query_within(&self, root: ElementId, selector: &SelectorList) -> Vec<ElementId> {
        if !self.is_connected(root) {
            return Vec::new();
        }
        self.descendants(root)
            .into_iter()
            .filter(|element| selector.matches(self, *element))
            .collect()
    }

    fn is_connected(&self, element: ElementId) -> bool {
        self.nodes.get(element).is_some_and(|node| node.connected)
    }

    fn attribute(&self, element: ElementId, name: &str) -> Option<String> {
        if name == "class" {
            return self
                .nodes
                .get(element)
                .filter(|node| !node.classes.is_empty())
                .map(|node| node.classes.join(" "));
        }
        self.attribute_value(element, name).map(ToOwned::to_owned)
    }

    fn set_attribute(&mut self, element: ElementId, name: &str, value: &str) {
        if name == "class" {
            let classes = split_classes(value);
            let Some(node) = self.node_mut(element) else {
                return;
            };
            if node.classes != classes {
                node.classes = classes;
                self.version += 1;
            }
            return;
        }
        let Some(node) = self.node_mut(element) else {
            return;
        };
        if node.attributes.get(name).map(String::as_str) != Some(value) {
            node.attributes.insert(name.to_string(), value.to_string());
            self.version += 1;
        }
    }

    fn text(&self, element: ElementId) -> String {
        let Some(node) = self.nodes.get(element) else {
            return String::new();
        };
        let mut text = node.text.clone();
        for child in &node.children {
            text.push_str(&self.text(*child));
        }
        text
    }

    fn set_text(&mut self, element: ElementId, text: &str) {
        let Some(node) = self.nodes.get(element) else {
            return;
        };
        if node.children.is_empty() && node.text == text {
            return;
        }
        let children = node.children.clone();
        for child in children {
            self.disconnect(child);
        }
        if let Some(node) = self.node_mut(element) {
            node.children.clear();
            node.text = text.to_string();
        }
        self.version += 1;
    }

    fn style(&self, element: ElementId, property: &str) -> Option<String> {
        self.nodes
            .get(element)
            .and_then(|node| node.style.get(property))
            .cloned()
    }

    fn set_style(&mut self, element: ElementId, property: &str, value: Option<&str>) {
        let Some(node) = self.node_mut(element) else {
            return;
        };
        let changed = match value.filter(|value| !value.is_empty()) {
            Some(value) => {
                if node.style.get(property).map(String::as_str) == Some(value) {
                    false
                } else {
                    node.style.insert(property.to_string(), value.to_string());
                    true
                }
            }
            None => node.style.remove(property).is_some(),
        };
        if changed {
            self.version += 1;
        }
    }

    fn has_class(&self, element: ElementId, class: &str) -> bool {
        self.matches_class(element, class)
    }

    fn add_class(&mut self, element: ElementId, class: &str) {
        let Some(node) = self.node_mut(element) else {
            return;
        };
        if !node.classes.iter().any(|candidate| candidate == class) {
            node.classes.push(class.to_string());
            self.version += 1;
        }
    }

    fn remove_class(&mut self, element: ElementId, class: &str) {
        let Some(node) = self.node_mut(element) else {
            return;
        };
        let before = node.classes.len();
        node.classes.retain(|candidate| candidate != class);
        if node.classes.len() != before {
            self.version += 1;
        }
    }

    fn mutation_version(&self) -> u64 {
        self.version
    }
}

fn split_classes(value: &str) -> Vec<String> {
    let mut classes: Vec<String> = Vec::new();
    for class in value.split_whitespace() {
        if !classes.iter().any(|existing| existing == class) {
            classes.push(class.to_string());
        }
    }
    classes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(source: &str) -> SelectorList {
        SelectorList::parse(source).expect("selector")
    }

    fn grid() -> (Document, ElementId, ElementId) {
        let mut doc = Document::new();
        let cell = doc.append(
            doc.body(),
            ElementBuilder::new("div").attr("role", "gridcell"),
        );
        let button = doc.append(
            cell,
            ElementBuilder::new("div")
                .attr("role", "button")
                .attr("aria-selected", "true")
                .child(ElementBuilder::new("span").class("FAxxKc").text("Standup")),
        );
        (doc, cell, button)
    }

    #[test]
    fn descendant_selector_matches_in_document_order() {
        let (mut doc, _, button) = grid();
        let loose = doc.append(doc.body(), ElementBuilder::new("div").attr("role", "button"));

        let matches = doc.query_all(&selector(r#"[role="gridcell"] [role="button"]"#));
        assert_eq!(matches, vec![button]);

        let any_button = doc.query_all(&selector(r#"[role="button"]"#));
        assert_eq!(any_button, vec![button, loose]);
    }

    #[test]
    fn text_concatenates_descendants() {
        let (doc, cell, _) = grid();
        assert_eq!(doc.text(cell), "Standup");
    }

    #[test]
    fn unchanged_writes_do_not_count_as_mutations() {
        let (mut doc, _, button) = grid();
        let start = doc.mutation_version();

        doc.set_style(button, "opacity", Some("0.5"));
        doc.add_class(button, "ghosted-event");
        doc.set_attribute(button, "data-energy", "2");
        let after_first = doc.mutation_version();
        assert_eq!(after_first, start + 3);

        doc.set_style(button, "opacity", Some("0.5"));
        doc.add_class(button, "ghosted-event");
        doc.set_attribute(button, "data-energy", "2");
        doc.set_style(button, "filter", None);
        assert_eq!(doc.mutation_version(), after_first);
    }

    #[test]
    fn removed_subtree_is_disconnected_and_unqueryable() {
        let (mut doc, cell, button) = grid();
        doc.remove(cell);

        assert!(!doc.is_connected(cell));
        assert!(!doc.is_connected(button));
        assert!(doc.query_all(&selector(r#"[role="button"]"#)).is_empty());
    }

    #[test]
    fn class_attribute_reflects_class_list() {
        let (mut doc, _, button) = grid();
        doc.set_attribute(button, "class", "a b a");
        assert_eq!(doc.attribute(button, "class").as_deref(), Some("a b"));
        doc.remove_class(button, "a");
        assert!(!doc.has_class(button, "a"));
        assert!(doc.has_class(button, "b"));
    }
}
