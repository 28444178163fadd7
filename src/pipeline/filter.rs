//! Listing filter rules.
//!
//! Price, size and rooms are free text as shown on the listing site
//! ("1.200 €", "62,5 m²", "3 Zi."). The first number in the text is used;
//! text without a number is unknown, and unknown values never fail a
//! min/max bound.

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::Listing;
use crate::pipeline::stage::{Capability, Stage, Verdict};

/// Filter bounds and excluded titles. All bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterRuleSet {
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub min_size: Option<f64>,
    #[serde(default)]
    pub max_size: Option<f64>,
    #[serde(default)]
    pub min_rooms: Option<f64>,
    #[serde(default)]
    pub max_rooms: Option<f64>,
    #[serde(default)]
    pub max_price_per_square: Option<f64>,

    /// Case-insensitive regexes; invalid ones match as plain text
    #[serde(default, alias = "excluded_titles")]
    pub excluded_title_patterns: Vec<String>,
}

impl FilterRuleSet {
    pub fn validate(&self) -> Result<()> {
        let ranges = [
            ("price", self.min_price, self.max_price),
            ("size", self.min_size, self.max_size),
            ("rooms", self.min_rooms, self.max_rooms),
        ];
        for (field, min, max) in ranges {
            if let (Some(min), Some(max)) = (min, max) {
                if min > max {
                    return Err(AppError::validation(format!(
                        "filters: min_{field} ({min}) exceeds max_{field} ({max})"
                    )));
                }
            }
        }
        if self.max_price_per_square.is_some_and(|v| v <= 0.0) {
            return Err(AppError::validation(
                "filters: max_price_per_square must be > 0",
            ));
        }
        if self
            .excluded_title_patterns
            .iter()
            .any(|p| p.trim().is_empty())
        {
            return Err(AppError::validation(
                "filters: empty excluded title pattern",
            ));
        }
        Ok(())
    }
}

/// Why a listing was filtered out.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    ExcludedTitle { pattern: String },
    BelowMin { field: &'static str, value: f64, min: f64 },
    AboveMax { field: &'static str, value: f64, max: f64 },
    UnknownPricePerSquare,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::ExcludedTitle { pattern } => {
                write!(f, "title matches excluded pattern '{pattern}'")
            }
            Rejection::BelowMin { field, value, min } => {
                write!(f, "{field} {value} below minimum {min}")
            }
            Rejection::AboveMax { field, value, max } => {
                write!(f, "{field} {value} above maximum {max}")
            }
            Rejection::UnknownPricePerSquare => {
                f.write_str("price per square unknown (price or size missing)")
            }
        }
    }
}

enum TitlePattern {
    Regex(Regex),
    /// Lowercased literal
    Text(String),
}

impl TitlePattern {
    fn compile(pattern: &str) -> Self {
        match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(re) => TitlePattern::Regex(re),
            Err(e) => {
                log::debug!("Excluded title '{pattern}' is not a regex ({e}); matching as text");
                TitlePattern::Text(pattern.to_lowercase())
            }
        }
    }

    fn is_match(&self, title: &str) -> bool {
        match self {
            TitlePattern::Regex(re) => re.is_match(title),
            TitlePattern::Text(text) => title.to_lowercase().contains(text.as_str()),
        }
    }
}

/// A rule set with its title patterns compiled.
pub struct Filter {
    rules: FilterRuleSet,
    titles: Vec<(String, TitlePattern)>,
}

impl Filter {
    pub fn new(rules: FilterRuleSet) -> Self {
        let titles = rules
            .excluded_title_patterns
            .iter()
            .map(|p| (p.clone(), TitlePattern::compile(p)))
            .collect();
        Self { rules, titles }
    }

    pub fn rules(&self) -> &FilterRuleSet {
        &self.rules
    }

    pub fn matches(&self, listing: &Listing) -> bool {
        self.evaluate(listing).is_none()
    }

    /// The first rule the listing violates, if any.
    pub fn evaluate(&self, listing: &Listing) -> Option<Rejection> {
        if let Some((pattern, _)) = self
            .titles
            .iter()
            .find(|(_, p)| p.is_match(&listing.title))
        {
            return Some(Rejection::ExcludedTitle {
                pattern: pattern.clone(),
            });
        }

        let bounds = [
            ("price", &listing.price, self.rules.min_price, self.rules.max_price),
            ("size", &listing.size, self.rules.min_size, self.rules.max_size),
            ("rooms", &listing.rooms, self.rules.min_rooms, self.rules.max_rooms),
        ];
        for (field, text, min, max) in bounds {
            let Some(value) = text.as_deref().and_then(parse_number) else {
                continue;
            };
            if let Some(min) = min.filter(|min| value < *min) {
                return Some(Rejection::BelowMin { field, value, min });
            }
            if let Some(max) = max.filter(|max| value > *max) {
                return Some(Rejection::AboveMax { field, value, max });
            }
        }

        if let Some(max) = self.rules.max_price_per_square {
            match price_per_square(listing) {
                Some(value) if value > max => {
                    return Some(Rejection::AboveMax {
                        field: "price_per_square",
                        value,
                        max,
                    });
                }
                Some(_) => {}
                None => return Some(Rejection::UnknownPricePerSquare),
            }
        }

        None
    }
}

/// Whether a listing passes every rule.
pub fn matches(listing: &Listing, rules: &FilterRuleSet) -> bool {
    Filter::new(rules.clone()).matches(listing)
}

/// Price divided by size; unknown when either is missing or size is zero.
pub fn price_per_square(listing: &Listing) -> Option<f64> {
    let price = listing.price.as_deref().and_then(parse_number)?;
    let size = listing.size.as_deref().and_then(parse_number)?;
    (size > 0.0).then(|| price / size)
}

/// Parse the first number in a free-text value.
///
/// When both `.` and `,` occur the right-most one is the decimal mark. A
/// single `,` is a decimal mark. A `.` followed only by three-digit groups
/// is a thousands separator, otherwise a decimal mark.
pub fn parse_number(text: &str) -> Option<f64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let run: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    let run = run.trim_end_matches(['.', ',']);

    let last_dot = run.rfind('.');
    let last_comma = run.rfind(',');

    let normalized = match (last_dot, last_comma) {
        (Some(dot), Some(comma)) => {
            let (decimal, thousands) = if dot > comma { ('.', ',') } else { (',', '.') };
            run.replace(thousands, "").replace(decimal, ".")
        }
        (None, Some(_)) => {
            if run.matches(',').count() == 1 {
                run.replace(',', ".")
            } else {
                thousands_only(run, ',')?
            }
        }
        (Some(_), None) => {
            if is_grouped(run, '.') {
                run.replace('.', "")
            } else if run.matches('.').count() == 1 {
                run.to_string()
            } else {
                return None;
            }
        }
        (None, None) => run.to_string(),
    };

    normalized.parse::<f64>().ok()
}

/// Every group after the first has exactly three digits.
fn is_grouped(run: &str, sep: char) -> bool {
    let mut groups = run.split(sep);
    groups.next();
    groups.all(|g| g.len() == 3)
}

fn thousands_only(run: &str, sep: char) -> Option<String> {
    is_grouped(run, sep).then(|| run.replace(sep, ""))
}

/// Drops listings that violate the rule set.
pub struct FilterStage {
    filter: Filter,
}

impl FilterStage {
    pub fn new(rules: FilterRuleSet) -> Self {
        Self {
            filter: Filter::new(rules),
        }
    }
}

#[async_trait]
impl Stage for FilterStage {
    fn name(&self) -> &str {
        "filter"
    }

    fn capability(&self) -> Capability {
        Capability::Filter
    }

    async fn process(&self, listing: &Listing) -> Result<Verdict> {
        Ok(match self.filter.evaluate(listing) {
            Some(rejection) => Verdict::drop(rejection.to_string()),
            None => Verdict::keep(),
        })
    }
}
