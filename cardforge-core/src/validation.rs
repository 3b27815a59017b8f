//! Composite Input Validation - Rule/Policy Separation
//!
//! Rules produce structured violations. Any `Error` violation is fatal to
//! the item: compositing is deterministic, so the same inputs would fail
//! the same way on every retry.

use serde::{Deserialize, Serialize};

use crate::model::CardContent;
use crate::templates::CardTemplate;

const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// Signature (8) + IHDR length/type (8) + IHDR data (13) + CRC (4).
pub(crate) const IHDR_END: usize = 33;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationViolation {
    pub rule: String,
    pub severity: ViolationSeverity,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub violations: Vec<ValidationViolation>,
    pub template_id: String,
    pub template_version: String,
}

impl ValidationResult {
    /// One line per error, for failure records.
    pub fn error_summary(&self) -> String {
        self.violations
            .iter()
            .filter(|v| v.severity == ViolationSeverity::Error)
            .map(|v| format!("{}: {}", v.rule, v.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Generated art plus the text that goes onto the card.
#[derive(Debug, Clone)]
pub struct CompositeInput<'a> {
    pub art: &'a [u8],
    /// `None` when the bytes are not a readable PNG.
    pub dimensions: Option<(u32, u32)>,
    pub content: &'a CardContent,
}

impl<'a> CompositeInput<'a> {
    pub fn new(art: &'a [u8], content: &'a CardContent) -> Self {
        Self {
            art,
            dimensions: png_dimensions(art),
            content,
        }
    }
}

/// Width and height from a PNG IHDR chunk.
pub fn png_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.len() < IHDR_END
        || bytes[..8] != PNG_SIGNATURE
        || bytes[8..12] != 13u32.to_be_bytes()
        || &bytes[12..16] != b"IHDR"
    {
        return None;
    }
    let width = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    let height = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn validate(&self, input: &CompositeInput<'_>, template: &CardTemplate) -> Vec<ValidationViolation>;
}

// --- Concrete Rules ---

pub struct ArtFormatRule;

impl ValidationRule for ArtFormatRule {
    fn name(&self) -> &'static str {
        "art_format"
    }

    fn validate(&self, input: &CompositeInput<'_>, _template: &CardTemplate) -> Vec<ValidationViolation> {
        if input.dimensions.is_some() {
            return vec![];
        }
        vec![ValidationViolation {
            rule: self.name().to_string(),
            severity: ViolationSeverity::Error,
            message: "Art is not a readable PNG".to_string(),
            expected: Some("PNG with IHDR".to_string()),
            actual: Some(format!("{} bytes", input.art.len())),
        }]
    }
}

pub struct AspectRatioRule;

impl ValidationRule for AspectRatioRule {
    fn name(&self) -> &'static str {
        "aspect_ratio"
    }

    fn validate(&self, input: &CompositeInput<'_>, template: &CardTemplate) -> Vec<ValidationViolation> {
        let rule = &template.validation.aspect_ratio;
        let Some((width, height)) = input.dimensions else {
            return vec![];
        };
        if !rule.enabled {
            return vec![];
        }

        let expected = template.aspect_ratio[0] as f64 / template.aspect_ratio[1] as f64;
        let actual = width as f64 / height as f64;

        if (expected - actual).abs() > rule.tolerance {
            vec![ValidationViolation {
                rule: self.name().to_string(),
                severity: ViolationSeverity::Error,
                message: "Aspect ratio mismatch".to_string(),
                expected: Some(format!(
                    "{}:{}",
                    template.aspect_ratio[0], template.aspect_ratio[1]
                )),
                actual: Some(format!("{:.3}", actual)),
            }]
        } else {
            vec![]
        }
    }
}

pub struct ResolutionRule;

impl ValidationRule for ResolutionRule {
    fn name(&self) -> &'static str {
        "resolution"
    }

    fn validate(&self, input: &CompositeInput<'_>, template: &CardTemplate) -> Vec<ValidationViolation> {
        let rule = &template.validation.resolution;
        let Some((width, height)) = input.dimensions else {
            return vec![];
        };
        if !rule.enabled || (width >= rule.min_width && height >= rule.min_height) {
            return vec![];
        }
        vec![ValidationViolation {
            rule: self.name().to_string(),
            severity: ViolationSeverity::Error,
            message: "Resolution too low".to_string(),
            expected: Some(format!("{}x{} minimum", rule.min_width, rule.min_height)),
            actual: Some(format!("{}x{}", width, height)),
        }]
    }
}

pub struct RequiredSlotsRule;

impl ValidationRule for RequiredSlotsRule {
    fn name(&self) -> &'static str {
        "required_slots"
    }

    fn validate(&self, input: &CompositeInput<'_>, template: &CardTemplate) -> Vec<ValidationViolation> {
        let mut violations = vec![];
        if input.content.title.trim().is_empty() {
            violations.push(ValidationViolation {
                rule: self.name().to_string(),
                severity: ViolationSeverity::Error,
                message: "Card title is empty".to_string(),
                expected: Some("non-empty title".to_string()),
                actual: None,
            });
        }
        for slot in template.slots.iter().filter(|s| s.required) {
            let filled = input
                .content
                .fields
                .get(&slot.name)
                .map_or(false, |v| !v.trim().is_empty());
            if !filled {
                violations.push(ValidationViolation {
                    rule: self.name().to_string(),
                    severity: ViolationSeverity::Error,
                    message: format!("Required slot '{}' is empty", slot.name),
                    expected: Some(slot.name.clone()),
                    actual: None,
                });
            }
        }
        violations
    }
}

pub struct SlotLengthRule;

impl ValidationRule for SlotLengthRule {
    fn name(&self) -> &'static str {
        "slot_length"
    }

    fn validate(&self, input: &CompositeInput<'_>, template: &CardTemplate) -> Vec<ValidationViolation> {
        template
            .slots
            .iter()
            .filter_map(|slot| {
                let max = slot.max_chars?;
                let value = input.content.fields.get(&slot.name)?;
                let len = value.chars().count();
                (len > max).then(|| ValidationViolation {
                    rule: self.name().to_string(),
                    severity: ViolationSeverity::Warning,
                    message: format!("Slot '{}' may overflow its frame", slot.name),
                    expected: Some(format!("<= {} chars", max)),
                    actual: Some(format!("{} chars", len)),
                })
            })
            .collect()
    }
}

/// Validator orchestrates rules and applies policy
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(ArtFormatRule),
                Box::new(AspectRatioRule),
                Box::new(ResolutionRule),
                Box::new(RequiredSlotsRule),
                Box::new(SlotLengthRule),
            ],
        }
    }

    pub fn validate(&self, input: &CompositeInput<'_>, template: &CardTemplate) -> ValidationResult {
        let violations: Vec<_> = self
            .rules
            .iter()
            .flat_map(|rule| rule.validate(input, template))
            .collect();

        // Warnings never block.
        let valid = !violations
            .iter()
            .any(|v| v.severity == ViolationSeverity::Error);

        ValidationResult {
            valid,
            violations,
            template_id: template.id.clone(),
            template_version: template.template_version.clone(),
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

/// Signature, IHDR and IEND with no image data. Enough for chunk-level checks.
#[cfg(test)]
pub(crate) fn png_header(width: u32, height: u32) -> Vec<u8> {
    let mut ihdr = b"IHDR".to_vec();
    ihdr.extend_from_slice(&width.to_be_bytes());
    ihdr.extend_from_slice(&height.to_be_bytes());
    ihdr.extend_from_slice(&[8, 6, 0, 0, 0]);

    let mut bytes = PNG_SIGNATURE.to_vec();
    bytes.extend_from_slice(&13u32.to_be_bytes());
    bytes.extend_from_slice(&ihdr);
    bytes.extend_from_slice(&crc32fast::hash(&ihdr).to_be_bytes());
    bytes.extend_from_slice(&0u32.to_be_bytes());
    bytes.extend_from_slice(b"IEND");
    bytes.extend_from_slice(&crc32fast::hash(b"IEND").to_be_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::test_template;
    use std::collections::BTreeMap;

    fn content(ability: &str) -> CardContent {
        CardContent {
            title: "LANTERN".to_string(),
            fields: BTreeMap::from([("ability".to_string(), ability.to_string())]),
        }
    }

    #[test]
    fn test_png_dimensions() {
        assert_eq!(png_dimensions(&png_header(1024, 1536)), Some((1024, 1536)));
        assert_eq!(png_dimensions(b"not a png at all, really not"), None);
        assert_eq!(png_dimensions(&[]), None);
    }

    #[test]
    fn test_valid_art_passes() {
        let art = png_header(1024, 1536);
        let c = content("Draw a card.");
        let result = Validator::new().validate(&CompositeInput::new(&art, &c), &test_template("t"));
        assert!(result.valid, "{:?}", result.violations);
    }

    #[test]
    fn test_wrong_aspect_is_error() {
        let art = png_header(1024, 1024);
        let c = content("Draw a card.");
        let result = Validator::new().validate(&CompositeInput::new(&art, &c), &test_template("t"));
        assert!(!result.valid);
        assert!(result.error_summary().contains("aspect_ratio"));
    }

    #[test]
    fn test_missing_required_slot_is_error() {
        let art = png_header(1024, 1536);
        let c = content("   ");
        let result = Validator::new().validate(&CompositeInput::new(&art, &c), &test_template("t"));
        assert!(!result.valid);
        assert!(result.error_summary().contains("ability"));
    }

    #[test]
    fn test_long_slot_is_only_warning() {
        let art = png_header(1024, 1536);
        let c = content(&"x".repeat(200));
        let result = Validator::new().validate(&CompositeInput::new(&art, &c), &test_template("t"));
        assert!(result.valid);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].severity, ViolationSeverity::Warning);
    }

    #[test]
    fn test_non_png_art_is_error() {
        let c = content("Draw a card.");
        let result = Validator::new().validate(&CompositeInput::new(b"garbage", &c), &test_template("t"));
        assert!(!result.valid);
        assert!(result.error_summary().contains("art_format"));
    }
}
