//! Compositing - Single Deterministic Merge
//!
//! CRITICAL: compose MUST run the validator first. Validation errors are
//! fatal; the same inputs produce the same result on every run, so there
//! is nothing to retry.
//!
//! The composite raster is the generated art PNG with the template
//! identity and every text layer stamped in as `iTXt` chunks directly
//! after IHDR. Typography is rendered downstream by the print layout.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::hashing::sha256_hex;
use crate::model::{CardContent, Category};
use crate::templates::CardTemplate;
use crate::validation::{CompositeInput, ValidationResult, ValidationViolation, Validator, IHDR_END};
use crate::ENGINE_VERSION;

const KEY_PREFIX: &str = "cardforge";

#[derive(Debug, Error)]
pub enum CompositeError {
    #[error("Composite input invalid: {}", .0.error_summary())]
    Invalid(ValidationResult),

    #[error("Template incompatible: {0}")]
    Template(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextLayer {
    pub slot: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeManifest {
    pub template_id: String,
    pub template_version: String,
    pub engine_version: String,
    pub category: Category,
    pub size: [u32; 2],
    pub art_hash: String,
    pub layers: Vec<TextLayer>,
    /// Non-blocking findings from validation.
    pub warnings: Vec<ValidationViolation>,
}

#[derive(Debug, Clone)]
pub struct CompositeArtifact {
    pub manifest: CompositeManifest,
    pub raster: Vec<u8>,
    pub hash: String,
}

pub struct Compositor {
    validator: Validator,
}

impl Compositor {
    pub fn new() -> Self {
        Self {
            validator: Validator::new(),
        }
    }

    /// Merge template, art and text into one raster.
    pub fn compose(
        &self,
        template: &CardTemplate,
        category: Category,
        art: &[u8],
        content: &CardContent,
    ) -> Result<CompositeArtifact, CompositeError> {
        template
            .check_engine_version(ENGINE_VERSION)
            .map_err(CompositeError::Template)?;

        // MANDATORY: no composite without validation.
        let input = CompositeInput::new(art, content);
        let validation = self.validator.validate(&input, template);
        if !validation.valid {
            return Err(CompositeError::Invalid(validation));
        }
        let Some((width, height)) = input.dimensions else {
            return Err(CompositeError::Invalid(validation));
        };

        let layers = text_layers(template, content);

        let mut chunks = vec![
            itxt_chunk(&format!("{}:template", KEY_PREFIX), &format!(
                "{}@{}",
                template.id, template.template_version
            )),
            itxt_chunk(&format!("{}:category", KEY_PREFIX), &category.to_string()),
        ];
        for layer in &layers {
            chunks.push(itxt_chunk(
                &format!("{}:{}", KEY_PREFIX, layer.slot),
                &layer.text,
            ));
        }

        let mut raster = Vec::with_capacity(art.len() + chunks.iter().map(Vec::len).sum::<usize>());
        raster.extend_from_slice(&art[..IHDR_END]);
        for chunk in &chunks {
            raster.extend_from_slice(chunk);
        }
        raster.extend_from_slice(&art[IHDR_END..]);

        let hash = sha256_hex(&raster);
        Ok(CompositeArtifact {
            manifest: CompositeManifest {
                template_id: template.id.clone(),
                template_version: template.template_version.clone(),
                engine_version: ENGINE_VERSION.to_string(),
                category,
                size: [width, height],
                art_hash: sha256_hex(art),
                layers,
                warnings: validation.violations,
            },
            raster,
            hash,
        })
    }
}

impl Default for Compositor {
    fn default() -> Self {
        Self::new()
    }
}

/// Title first, then template slots in declaration order, then any extra
/// fields in key order.
fn text_layers(template: &CardTemplate, content: &CardContent) -> Vec<TextLayer> {
    let mut remaining: BTreeMap<&str, &str> = content
        .fields
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    let mut layers = vec![TextLayer {
        slot: "title".to_string(),
        text: content.title.clone(),
    }];
    for slot in &template.slots {
        if let Some(text) = remaining.remove(slot.name.as_str()) {
            layers.push(TextLayer {
                slot: slot.name.clone(),
                text: text.to_string(),
            });
        }
    }
    layers.extend(remaining.into_iter().map(|(slot, text)| TextLayer {
        slot: slot.to_string(),
        text: text.to_string(),
    }));
    layers
}

/// Uncompressed international text chunk.
fn itxt_chunk(keyword: &str, text: &str) -> Vec<u8> {
    // Keywords are 1-79 Latin-1 bytes.
    let keyword: String = keyword
        .chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .take(79)
        .collect();

    let mut data = Vec::with_capacity(keyword.len() + text.len() + 5);
    data.extend_from_slice(keyword.as_bytes());
    data.push(0); // keyword terminator
    data.push(0); // compression flag
    data.push(0); // compression method
    data.push(0); // empty language tag
    data.push(0); // empty translated keyword
    data.extend_from_slice(text.as_bytes());

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(b"iTXt");
    hasher.update(&data);

    let mut chunk = Vec::with_capacity(data.len() + 12);
    chunk.extend_from_slice(&(data.len() as u32).to_be_bytes());
    chunk.extend_from_slice(b"iTXt");
    chunk.extend_from_slice(&data);
    chunk.extend_from_slice(&hasher.finalize().to_be_bytes());
    chunk
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CardType, Rarity};
    use crate::templates::test_template;
    use crate::validation::{png_dimensions, png_header};

    fn art() -> Vec<u8> {
        png_header(1024, 1536)
    }

    fn content() -> CardContent {
        CardContent {
            title: "LANTERN".to_string(),
            fields: BTreeMap::from([
                ("flavor".to_string(), "It remembers the dark.".to_string()),
                ("ability".to_string(), "Reveal the top card.".to_string()),
                ("trivia".to_string(), "From Latin lanterna.".to_string()),
            ]),
        }
    }

    fn category() -> Category {
        Category::new(CardType::Noun, Rarity::Common)
    }

    #[test]
    fn test_compose_is_deterministic() {
        let compositor = Compositor::new();
        let template = test_template("card-standard");
        let a = compositor.compose(&template, category(), &art(), &content()).unwrap();
        let b = compositor.compose(&template, category(), &art(), &content()).unwrap();
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.raster, b.raster);
    }

    #[test]
    fn test_composite_stays_a_png() {
        let template = test_template("card-standard");
        let c = Compositor::new().compose(&template, category(), &art(), &content()).unwrap();
        assert_eq!(png_dimensions(&c.raster), Some((1024, 1536)));
        assert!(c.raster.ends_with(&art()[IHDR_END..]));
        assert_eq!(c.manifest.size, [1024, 1536]);
    }

    #[test]
    fn test_layers_follow_template_slot_order() {
        let template = test_template("card-standard");
        let c = Compositor::new().compose(&template, category(), &art(), &content()).unwrap();
        let slots: Vec<_> = c.manifest.layers.iter().map(|l| l.slot.as_str()).collect();
        assert_eq!(slots, vec!["title", "ability", "flavor", "trivia"]);
    }

    #[test]
    fn test_invalid_input_is_rejected() {
        let template = test_template("card-standard");
        let square = png_header(1024, 1024);
        let err = Compositor::new()
            .compose(&template, category(), &square, &content())
            .unwrap_err();
        assert!(matches!(err, CompositeError::Invalid(_)));
        assert!(err.to_string().contains("aspect_ratio"));
    }

    #[test]
    fn test_newer_template_rejected() {
        let mut template = test_template("card-standard");
        template.engine_min_version = "99.0.0".to_string();
        let err = Compositor::new()
            .compose(&template, category(), &art(), &content())
            .unwrap_err();
        assert!(matches!(err, CompositeError::Template(_)));
    }

    #[test]
    fn test_itxt_chunk_layout() {
        let chunk = itxt_chunk("cardforge:title", "LANTERN");
        let len = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as usize;
        assert_eq!(&chunk[4..8], b"iTXt");
        assert_eq!(chunk.len(), len + 12);
    }
}
