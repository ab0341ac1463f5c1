//! The CSS subset the event strategies are written in: type selectors, `.class`,
//! `[attr]`, `[attr="value"]`, the descendant combinator and `,` groups.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("empty selector")]
    Empty,
    #[error("unexpected character '{found}' at {position} in selector")]
    Unexpected { found: char, position: usize },
    #[error("unterminated {0} in selector")]
    Unterminated(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSelector {
    pub name: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompoundSelector {
    pub tag: Option<String>,
    pub classes: Vec<String>,
    pub attributes: Vec<AttributeSelector>,
}

/// Compounds joined by descendant combinators, outermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplexSelector {
    pub compounds: Vec<CompoundSelector>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorList {
    source: String,
    pub selectors: Vec<ComplexSelector>,
}

/// What selector matching needs to know about a tree.
pub trait SelectorTarget {
    type Node: Copy;

    fn tag_name(&self, node: Self::Node) -> Option<&str>;
    fn matches_class(&self, node: Self::Node, class: &str) -> bool;
    fn attribute_value(&self, node: Self::Node, name: &str) -> Option<&str>;
    fn parent_node(&self, node: Self::Node) -> Option<Self::Node>;
}

impl CompoundSelector {
    fn is_empty(&self) -> bool {
        self.tag.is_none() && self.classes.is_empty() && self.attributes.is_empty()
    }

    pub fn matches<T: SelectorTarget>(&self, target: &T, node: T::Node) -> bool {
        if let Some(tag) = self.tag.as_deref() {
            let Some(actual) = target.tag_name(node) else {
                return false;
            };
            if tag != "*" && !actual.eq_ignore_ascii_case(tag) {
                return false;
            }
        }
        if !self.classes.iter().all(|class| target.matches_class(node, class)) {
            return false;
        }
        self.attributes.iter().all(|attribute| {
            match (target.attribute_value(node, &attribute.name), attribute.value.as_deref()) {
                (Some(_), None) => true,
                (Some(actual), Some(expected)) => actual == expected,
                (None, _) => false,
            }
        })
    }
}

impl ComplexSelector {
    pub fn matches<T: SelectorTarget>(&self, target: &T, node: T::Node) -> bool {
        match self.compounds.len() {
            0 => false,
            len => self.matches_from(target, node, len - 1),
        }
    }

    fn matches_from<T: SelectorTarget>(&self, target: &T, node: T::Node, index: usize) -> bool {
        if !self.compounds[index].matches(target, node) {
            return false;
        }
        if index == 0 {
            return true;
        }
        let mut ancestor = target.parent_node(node);
        while let Some(current) = ancestor {
            if self.matches_from(target, current, index - 1) {
                return true;
            }
            ancestor = target.parent_node(current);
        }
        false
    }
}

impl SelectorList {
    pub fn parse(source: &str) -> Result<Self, SelectorError> {
        let mut parser = Parser {
            chars: source.char_indices().collect(),
            position: 0,
        };
        let selectors = parser.parse_list()?;
        Ok(Self {
            source: source.trim().to_string(),
            selectors,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches<T: SelectorTarget>(&self, target: &T, node: T::Node) -> bool {
        self.selectors
            .iter()
            .any(|selector| selector.matches(target, node))
    }
}

impl FromStr for SelectorList {
    type Err = SelectorError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        Self::parse(source)
    }
}

impl fmt::Display for SelectorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

struct Parser {
    chars: Vec<(usize, char)>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.position).map(|(_, c)| *c)
    }

    fn bump(&mut self) -> Option<char> {
        let next = self.peek();
        if next.is_some() {
            self.position += 1;
        }
        next
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.position)
            .map(|(offset, _)| *offset)
            .unwrap_or_else(|| self.chars.last().map(|(offset, c)| offset + c.len_utf8()).unwrap_or(0))
    }

    fn skip_whitespace(&mut self) -> bool {
        let start = self.position;
        while self.peek().is_some_and(char::is_whitespace) {
            self.position += 1;
        }
        self.position > start
    }

    fn unexpected(&self) -> SelectorError {
        match self.peek() {
            Some(found) => SelectorError::Unexpected {
                found,
                position: self.offset(),
            },
            None => SelectorError::Empty,
        }
    }

    fn parse_list(&mut self) -> Result<Vec<ComplexSelector>, SelectorError> {
        let mut selectors = Vec::new();
        loop {
            self.skip_whitespace();
            selectors.push(self.parse_complex()?);
            self.skip_whitespace();
            match self.peek() {
                None => break,
                Some(',') => {
                    self.bump();
                }
                Some(_) => return Err(self.unexpected()),
            }
        }
        Ok(selectors)
    }

    fn parse_complex(&mut self) -> Result<ComplexSelector, SelectorError> {
        let mut compounds = Vec::new();
        loop {
            let compound = self.parse_compound()?;
            if compound.is_empty() {
                if compounds.is_empty() {
                    return Err(self.unexpected());
                }
                break;
            }
            compounds.push(compound);
            let had_space = self.skip_whitespace();
            match self.peek() {
                None | Some(',') => break,
                Some(_) if had_space => continue,
                Some(_) => return Err(self.unexpected()),
            }
        }
        Ok(ComplexSelector { compounds })
    }

    fn parse_compound(&mut self) -> Result<CompoundSelector, SelectorError> {
        let mut compound = CompoundSelector::default();
        if self.peek() == Some('*') {
            self.bump();
            compound.tag = Some("*".to_string());
        } else if self.peek().is_some_and(is_ident_char) {
            compound.tag = Some(self.parse_ident()?);
        }
        loop {
            match self.peek() {
                Some('.') => {
                    self.bump();
                    compound.classes.push(self.parse_ident()?);
                }
                Some('[') => {
                    self.bump();
                    compound.attributes.push(self.parse_attribute()?);
                }
                _ => break,
            }
        }
        Ok(compound)
    }

    fn parse_ident(&mut self) -> Result<String, SelectorError> {
        let mut ident = String::new();
        while let Some(c) = self.peek().filter(|c| is_ident_char(*c)) {
            ident.push(c);
            self.position += 1;
        }
        if ident.is_empty() {
            return Err(self.unexpected());
        }
        Ok(ident)
    }

    fn parse_attribute(&mut self) -> Result<AttributeSelector, SelectorError> {
        self.skip_whitespace();
        let name = self.parse_ident()?;
        self.skip_whitespace();
        let value = match self.peek() {
            Some('=') => {
                self.bump();
                self.skip_whitespace();
                Some(self.parse_attribute_value()?)
            }
            _ => None,
        };
        self.skip_whitespace();
        match self.bump() {
            Some(']') => Ok(AttributeSelector { name, value }),
            Some(_) => {
                self.position -= 1;
                Err(self.unexpected())
            }
            None => Err(SelectorError::Unterminated("attribute selector")),
        }
    }

    fn parse_attribute_value(&mut self) -> Result<String, SelectorError> {
        match self.peek() {
            Some(quote @ ('"' | '\'')) => {
                self.bump();
                let mut value = String::new();
                loop {
                    match self.bump() {
                        Some(c) if c == quote => return Ok(value),
                        Some(c) => value.push(c),
                        None => return Err(SelectorError::Unterminated("quoted value")),
                    }
                }
            }
            _ => self.parse_ident(),
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}
