//! Typed view over document content.
//!
//! Storage keeps content as opaque JSON. Only the shapes that point at other
//! documents are decoded here; everything else stays [`FileContent::Opaque`].

use serde_json::Value;

use crate::models::FileType;

#[derive(Debug, Clone, PartialEq)]
pub enum AssetRef {
    /// A saved question by document id.
    Question { id: i64 },
    /// Inline content such as text or markdown blocks.
    Inline { kind: String },
    /// A question reference without a usable id.
    Malformed(Value),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Slide {
    pub assets: Vec<AssetRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FileContent {
    Dashboard { assets: Vec<AssetRef> },
    Notebook { assets: Vec<AssetRef> },
    Presentation { slides: Vec<Slide> },
    Opaque(Value),
}

impl FileContent {
    pub fn decode(file_type: FileType, content: &Value) -> Self {
        match file_type {
            FileType::Dashboard => Self::Dashboard {
                assets: decode_assets(content.get("assets")),
            },
            FileType::Notebook => Self::Notebook {
                assets: decode_assets(content.get("assets")),
            },
            FileType::Presentation => Self::Presentation {
                slides: content
                    .get("slides")
                    .and_then(Value::as_array)
                    .map(|slides| {
                        slides
                            .iter()
                            .map(|slide| Slide {
                                assets: decode_assets(slide.get("assets")),
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            _ => Self::Opaque(content.clone()),
        }
    }

    /// Every asset entry, across slides for presentations.
    pub fn assets(&self) -> Vec<&AssetRef> {
        match self {
            Self::Dashboard { assets } | Self::Notebook { assets } => assets.iter().collect(),
            Self::Presentation { slides } => {
                slides.iter().flat_map(|slide| slide.assets.iter()).collect()
            }
            Self::Opaque(_) => Vec::new(),
        }
    }

    /// Ids of every question this content points at, in order of appearance.
    pub fn question_ids(&self) -> Vec<i64> {
        self.assets()
            .into_iter()
            .filter_map(|asset| match asset {
                AssetRef::Question { id } => Some(*id),
                _ => None,
            })
            .collect()
    }
}

fn decode_assets(assets: Option<&Value>) -> Vec<AssetRef> {
    assets
        .and_then(Value::as_array)
        .map(|items| items.iter().map(decode_asset).collect())
        .unwrap_or_default()
}

fn decode_asset(asset: &Value) -> AssetRef {
    let kind = asset.get("type").and_then(Value::as_str).unwrap_or_default();
    if kind != "question" {
        return AssetRef::Inline {
            kind: kind.to_string(),
        };
    }
    // Older exports stored ids as strings.
    let id = match asset.get("id") {
        Some(Value::Number(number)) => number.as_i64(),
        Some(Value::String(text)) => text.trim().parse().ok(),
        _ => None,
    };
    match id {
        Some(id) => AssetRef::Question { id },
        None => AssetRef::Malformed(asset.clone()),
    }
}
