//! Monetary notation parser.
//!
//! Patterns are tried in a fixed order and the first one that matches
//! anywhere in the text wins:
//! 1. Canadian dollars: `CDN$`, `CD$`, `CAD`, `CAD$` → CAD
//! 2. US dollars: `USD`, `US$`, `USD$` → USD
//!
//! Whitespace is allowed between a qualifier and its `$` (`CDN $5.00`).
//! 3. Bare `$` → USD
//!
//! Only the first mention matched by the winning pattern is used.

use std::str::FromStr;

use regex::Regex;
use rust_decimal::Decimal;
use tracing::debug;

use crate::pipeline::types::{Currency, ParsedAmount};

/// Numeral right after the notation token: optional thousands groups,
/// up to two fractional digits.
const NUMERAL: &str = r"(\d{1,3}(?:,\d{3})+(?:\.\d{1,2})?|\d+(?:\.\d{1,2})?)";

/// A currency-qualified notation with a compiled regex.
#[derive(Debug, Clone)]
pub struct NotationPattern {
    /// Human-readable name, used in logs.
    pub name: &'static str,
    pub currency: Currency,
    /// Capture group 1 is the numeral.
    pub regex: Regex,
}

impl NotationPattern {
    fn new(name: &'static str, currency: Currency, prefix: &str) -> Self {
        let regex = Regex::new(&format!(r"{prefix}\s*{NUMERAL}"))
            .expect("notation patterns are constant and valid");
        Self {
            name,
            currency,
            regex,
        }
    }
}

/// Ordered first-match-wins parser.
#[derive(Debug, Clone)]
pub struct TransactionParser {
    patterns: Vec<NotationPattern>,
}

impl Default for TransactionParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionParser {
    /// Parser with the standard CAD → USD → bare-symbol ordering.
    pub fn new() -> Self {
        Self {
            patterns: vec![
                NotationPattern::new("cad", Currency::Cad, r"\b(?:CDN\s*\$|CD\s*\$|CAD\s*\$?)"),
                NotationPattern::new("usd", Currency::Usd, r"\b(?:USD\s*\$?|US\s*\$)"),
                NotationPattern::new("bare-dollar", Currency::Usd, r"\$"),
            ],
        }
    }

    pub fn patterns(&self) -> &[NotationPattern] {
        &self.patterns
    }

    /// Extract the first amount from `text`, or `None` if nothing matches.
    pub fn parse(&self, text: &str) -> Option<ParsedAmount> {
        for pattern in &self.patterns {
            let Some(caps) = pattern.regex.captures(text) else {
                continue;
            };
            let Some(numeral) = caps.get(1) else {
                continue;
            };

            match parse_numeral(numeral.as_str()) {
                Some(amount) => {
                    debug!(
                        pattern = pattern.name,
                        amount = %amount,
                        currency = %pattern.currency,
                        "Matched monetary notation"
                    );
                    return Some(ParsedAmount {
                        amount,
                        currency: pattern.currency,
                    });
                }
                None => {
                    debug!(
                        pattern = pattern.name,
                        numeral = numeral.as_str(),
                        "Numeral out of range, trying next pattern"
                    );
                }
            }
        }
        None
    }
}

/// "1,000.00" → 1000.00. Scale from the text is kept.
fn parse_numeral(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw.chars().filter(|c| *c != ',').collect();
    Decimal::from_str(&cleaned).ok()
}
