//! Card Template System - Structural Contracts
//!
//! A template fixes the card's frame: canonical size, the text slots the
//! compositor fills, and the raster used as the structural exemplar at the
//! head of every reference set.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::model::{Category, Rarity};

pub type TemplateId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardTemplate {
    pub id: TemplateId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub template_version: String,
    pub engine_min_version: String,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub superseded_by: Option<String>,
    /// Rarities this template is specialised for. Empty means any.
    #[serde(default)]
    pub rarities: Vec<Rarity>,
    pub aspect_ratio: [u32; 2],
    pub canonical_size: [u32; 2],
    /// Template raster, relative to the templates directory.
    pub image: PathBuf,
    #[serde(default)]
    pub slots: Vec<TextSlot>,
    #[serde(default)]
    pub validation: ValidationConfig,
}

fn default_true() -> bool {
    true
}

/// A named text region on the card face.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextSlot {
    pub name: String,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub max_chars: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationConfig {
    #[serde(default)]
    pub aspect_ratio: RuleConfig,
    #[serde(default)]
    pub resolution: ResolutionRule,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tolerance: default_tolerance(),
        }
    }
}

fn default_tolerance() -> f64 {
    0.01
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionRule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_width")]
    pub min_width: u32,
    #[serde(default = "default_min_height")]
    pub min_height: u32,
}

impl Default for ResolutionRule {
    fn default() -> Self {
        Self {
            enabled: true,
            min_width: default_min_width(),
            min_height: default_min_height(),
        }
    }
}

fn default_min_width() -> u32 {
    512
}

fn default_min_height() -> u32 {
    768
}

impl CardTemplate {
    pub fn applies_to(&self, category: &Category) -> bool {
        self.rarities.is_empty() || self.rarities.contains(&category.rarity)
    }

    /// Engine must be at least `engine_min_version`.
    pub fn check_engine_version(&self, engine_version: &str) -> Result<(), String> {
        let engine = semver::Version::parse(engine_version)
            .map_err(|e| format!("invalid engine version {}: {}", engine_version, e))?;
        let min = semver::Version::parse(&self.engine_min_version).map_err(|e| {
            format!(
                "template {} has invalid engine_min_version {}: {}",
                self.id, self.engine_min_version, e
            )
        })?;
        if engine < min {
            return Err(format!(
                "template {} v{} requires engine >= {}, current is {}",
                self.id, self.template_version, self.engine_min_version, engine_version
            ));
        }
        Ok(())
    }
}

/// Template registry - loads and caches templates
pub struct TemplateRegistry {
    root: PathBuf,
    templates: HashMap<TemplateId, CardTemplate>,
    default_id: TemplateId,
}

impl TemplateRegistry {
    pub fn new(root: impl Into<PathBuf>, default_id: impl Into<TemplateId>) -> Self {
        Self {
            root: root.into(),
            templates: HashMap::new(),
            default_id: default_id.into(),
        }
    }

    /// Load every `*.json` template in `dir`. Unparseable files are skipped with a warning.
    pub fn load_from_dir(dir: &Path, default_id: &str) -> Result<Self, std::io::Error> {
        let mut registry = Self::new(dir, default_id);
        if dir.exists() {
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.extension().map_or(false, |e| e == "json") {
                    let content = fs::read_to_string(&path)?;
                    match serde_json::from_str::<CardTemplate>(&content) {
                        Ok(template) => {
                            debug!(template = %template.id, "loaded card template");
                            registry.register(template);
                        }
                        Err(e) => warn!(path = %path.display(), error = %e, "skipping invalid template"),
                    }
                }
            }
        }
        Ok(registry)
    }

    pub fn get(&self, id: &str) -> Option<&CardTemplate> {
        self.templates.get(id)
    }

    pub fn list(&self) -> Vec<&CardTemplate> {
        let mut all: Vec<_> = self.templates.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn register(&mut self, template: CardTemplate) {
        self.templates.insert(template.id.clone(), template);
    }

    /// Most specific non-deprecated template for the category, else the default.
    pub fn for_category(&self, category: &Category) -> Option<&CardTemplate> {
        self.list()
            .into_iter()
            .find(|t| !t.deprecated && !t.rarities.is_empty() && t.applies_to(category))
            .or_else(|| self.get(&self.default_id))
    }

    /// Absolute path of a template's raster.
    pub fn image_path(&self, template: &CardTemplate) -> PathBuf {
        if template.image.is_absolute() {
            template.image.clone()
        } else {
            self.root.join(&template.image)
        }
    }
}

#[cfg(test)]
pub(crate) fn test_template(id: &str) -> CardTemplate {
    CardTemplate {
        id: id.to_string(),
        name: "Standard Card".to_string(),
        description: String::new(),
        template_version: "1.0.0".to_string(),
        engine_min_version: "1.0.0".to_string(),
        deprecated: false,
        superseded_by: None,
        rarities: vec![],
        aspect_ratio: [2, 3],
        canonical_size: [1024, 1536],
        image: PathBuf::from("card_standard.png"),
        slots: vec![
            TextSlot {
                name: "ability".to_string(),
                required: true,
                max_chars: Some(120),
            },
            TextSlot {
                name: "flavor".to_string(),
                required: false,
                max_chars: None,
            },
        ],
        validation: ValidationConfig::default(),
    }
}
