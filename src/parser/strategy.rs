//! Ordered field strategies.
//!
//! A field is described by a list of strategies tried in order; the first
//! one that yields a non-empty value wins. Strategies are plain data so they
//! can come from the settings file as well as from the built-in profiles.

use regex::Regex;
use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};

use super::normalize::collapse_whitespace;
use super::ExtractError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldStrategy {
    /// Text of elements matching `selector` inside the item.
    Text {
        selector: String,
        /// Pick the longest candidate instead of the first.
        #[serde(default)]
        longest: bool,
        /// Elements (and descendants) carrying one of these classes are ignored.
        #[serde(default)]
        exclude_classes: Vec<String>,
    },
    /// Attribute of the first matching element.
    Attr { selector: String, attr: String },
    /// Attribute on the item element itself.
    OwnAttr { attr: String },
    /// Regex over the item's text (or the text of `within`); first capture
    /// group if there is one, whole match otherwise.
    Pattern {
        pattern: String,
        #[serde(default)]
        within: Option<String>,
    },
}

impl FieldStrategy {
    pub fn text(selector: &str) -> Self {
        FieldStrategy::Text {
            selector: selector.to_string(),
            longest: false,
            exclude_classes: Vec::new(),
        }
    }

    pub fn own_attr(attr: &str) -> Self {
        FieldStrategy::OwnAttr {
            attr: attr.to_string(),
        }
    }

    pub fn pattern(pattern: &str, within: Option<&str>) -> Self {
        FieldStrategy::Pattern {
            pattern: pattern.to_string(),
            within: within.map(str::to_string),
        }
    }
}

/// Media references: for each element matching `selector`, the first
/// present attribute of `attrs` (lazy-loading attributes go first).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaStrategy {
    pub selector: String,
    pub attrs: Vec<String>,
}

enum Compiled {
    Text {
        selector: Selector,
        longest: bool,
        exclude: Vec<String>,
    },
    Attr {
        selector: Selector,
        attr: String,
    },
    OwnAttr(String),
    Pattern {
        re: Regex,
        within: Option<Selector>,
    },
}

/// A compiled, ordered list of strategies for one field.
pub struct FieldRule {
    strategies: Vec<Compiled>,
}

impl FieldRule {
    pub fn compile(strategies: &[FieldStrategy]) -> Result<Self, ExtractError> {
        let strategies = strategies
            .iter()
            .map(|s| -> Result<Compiled, ExtractError> {
                Ok(match s {
                    FieldStrategy::Text {
                        selector,
                        longest,
                        exclude_classes,
                    } => Compiled::Text {
                        selector: compile_selector(selector)?,
                        longest: *longest,
                        exclude: exclude_classes.clone(),
                    },
                    FieldStrategy::Attr { selector, attr } => Compiled::Attr {
                        selector: compile_selector(selector)?,
                        attr: attr.clone(),
                    },
                    FieldStrategy::OwnAttr { attr } => Compiled::OwnAttr(attr.clone()),
                    FieldStrategy::Pattern { pattern, within } => Compiled::Pattern {
                        re: Regex::new(pattern)?,
                        within: within.as_deref().map(compile_selector).transpose()?,
                    },
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FieldRule { strategies })
    }

    /// First non-empty value produced by the strategies, in order.
    pub fn first(&self, item: ElementRef) -> Option<String> {
        self.strategies
            .iter()
            .find_map(|s| apply(s, item).filter(|v| !v.is_empty()))
    }
}

fn apply(strategy: &Compiled, item: ElementRef) -> Option<String> {
    match strategy {
        Compiled::Text {
            selector,
            longest,
            exclude,
        } => {
            let mut candidates = item
                .select(selector)
                .filter(|el| !has_any_class(*el, exclude))
                .map(|el| text_of(el, exclude))
                .filter(|t| !t.is_empty());
            if *longest {
                candidates.max_by_key(|t| t.chars().count())
            } else {
                candidates.next()
            }
        }
        Compiled::Attr { selector, attr } => item
            .select(selector)
            .find_map(|el| el.value().attr(attr))
            .map(|v| v.trim().to_string()),
        Compiled::OwnAttr(attr) => item.value().attr(attr).map(|v| v.trim().to_string()),
        Compiled::Pattern { re, within } => {
            let text = match within {
                Some(sel) => item.select(sel).next().map(|el| text_of(el, &[]))?,
                None => text_of(item, &[]),
            };
            let caps = re.captures(&text)?;
            caps.get(1)
                .or_else(|| caps.get(0))
                .map(|m| m.as_str().trim().to_string())
        }
    }
}

impl MediaStrategy {
    pub fn compile(&self) -> Result<(Selector, Vec<String>), ExtractError> {
        Ok((compile_selector(&self.selector)?, self.attrs.clone()))
    }
}

/// Raw media URLs from the first strategy that finds any.
pub fn media_urls(strategies: &[(Selector, Vec<String>)], item: ElementRef) -> Vec<String> {
    strategies
        .iter()
        .map(|(selector, attrs)| {
            item.select(selector)
                .filter_map(|el| {
                    attrs
                        .iter()
                        .find_map(|a| el.value().attr(a).filter(|v| !v.trim().is_empty()))
                        .map(str::to_string)
                })
                .collect::<Vec<_>>()
        })
        .find(|urls| !urls.is_empty())
        .unwrap_or_default()
}

pub fn compile_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::InvalidSelector {
        selector: selector.to_string(),
        reason: format!("{:?}", e),
    })
}

fn has_any_class(el: ElementRef, classes: &[String]) -> bool {
    !classes.is_empty() && el.value().classes().any(|c| classes.iter().any(|x| x == c))
}

/// Whitespace-normalised text of `el`, skipping subtrees that carry one of
/// the excluded classes.
pub fn text_of(el: ElementRef, exclude: &[String]) -> String {
    let root = el.id();
    let mut parts = Vec::new();
    for node in el.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = !exclude.is_empty()
            && node
                .ancestors()
                .take_while(|a| a.id() != root)
                .filter_map(ElementRef::wrap)
                .any(|a| has_any_class(a, exclude));
        if !hidden {
            let t = text.trim();
            if !t.is_empty() {
                parts.push(t);
            }
        }
    }
    collapse_whitespace(&parts.join(" "))
}
