//! Configured field extraction over parsed HTML documents.
//!
//! A parser config names a CSS selector, the attribute to read from each
//! match, an optional element matcher that filters candidates, and an
//! optional regex replacer applied to every extracted value.

use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

use crate::infrastructure::config::{Attribute, MatchOperator, MatcherConfig, ParserConfig};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector {selector:?}: {message}")]
    InvalidSelector { selector: String, message: String },
}

/// Compiled extraction pipeline for one [`ParserConfig`].
pub struct Extractor<'c> {
    config: &'c ParserConfig,
    selector: Selector,
}

impl<'c> Extractor<'c> {
    pub fn new(config: &'c ParserConfig) -> Result<Self, ExtractError> {
        let selector = Selector::parse(&config.selector).map_err(|err| {
            ExtractError::InvalidSelector {
                selector: config.selector.clone(),
                message: err.to_string(),
            }
        })?;
        Ok(Self { config, selector })
    }

    /// Run the pipeline: select, filter, read, replace. Elements that fail
    /// the matcher or lack the requested attribute are skipped silently.
    pub fn extract(&self, doc: &Html) -> Vec<String> {
        let mut values = Vec::new();
        for element in doc.select(&self.selector) {
            if !self.matches(&element) {
                continue;
            }
            let Some(raw) = read_attribute(&element, self.config.value.attribute) else {
                continue;
            };
            let value = match &self.config.value.replacer {
                Some(replacer) => replacer
                    .regex
                    .replace_all(&raw, replacer.replacement.as_str())
                    .into_owned(),
                None => raw,
            };
            values.push(value);
        }
        values
    }

    fn matches(&self, element: &ElementRef<'_>) -> bool {
        let Some(matcher) = &self.config.matcher else {
            return true;
        };
        let Some(value) = read_attribute(element, matcher.attribute) else {
            return false;
        };
        apply_operator(matcher, &value)
    }
}

fn apply_operator(matcher: &MatcherConfig, value: &str) -> bool {
    match matcher.operator {
        MatchOperator::Contains => value.contains(&matcher.value),
    }
}

fn read_attribute(element: &ElementRef<'_>, attribute: Attribute) -> Option<String> {
    match attribute {
        Attribute::InnerText => Some(element.text().collect::<String>()),
        Attribute::Href => element.value().attr("href").map(str::to_string),
        Attribute::Title => element.value().attr("title").map(str::to_string),
    }
}
