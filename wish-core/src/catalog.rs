//! Static gift and character definitions, read once at startup.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::model::{Character, Gift, GiftId};

pub const GIFTS_FILE: &str = "gifts.json";
pub const CHARACTERS_FILE: &str = "characters.json";

#[derive(Debug, Error)]
pub enum CatalogLoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("duplicate gift id {0}")]
    DuplicateGiftId(GiftId),
}

/// Gift definition as stored on disk; reveal state is applied later from progress.
#[derive(Debug, Deserialize)]
struct GiftDefinition {
    id: GiftId,
    description: String,
    #[serde(default)]
    themes: Vec<String>,
    #[serde(default)]
    image_path: String,
}

impl From<GiftDefinition> for Gift {
    fn from(def: GiftDefinition) -> Self {
        Gift::new(def.id, def.description, def.themes, def.image_path)
    }
}

#[derive(Debug, Default)]
pub struct Catalog {
    pub gifts: Vec<Gift>,
    pub characters: Vec<Character>,
}

impl Catalog {
    pub fn new(gifts: Vec<Gift>, characters: Vec<Character>) -> Self {
        Self { gifts, characters }
    }

    /// Loads both collections from `data_dir`. A collection that fails to load
    /// comes back empty; the failures are returned alongside for the caller.
    pub fn load(data_dir: impl AsRef<Path>) -> (Self, Vec<CatalogLoadError>) {
        let data_dir = data_dir.as_ref();
        let mut errors = Vec::new();

        let gifts = load_gifts(data_dir.join(GIFTS_FILE)).unwrap_or_else(|err| {
            tracing::error!("error loading gifts: {err}");
            errors.push(err);
            Vec::new()
        });
        let characters = load_characters(data_dir.join(CHARACTERS_FILE)).unwrap_or_else(|err| {
            tracing::error!("error loading characters: {err}");
            errors.push(err);
            Vec::new()
        });

        tracing::info!(
            gifts = gifts.len(),
            characters = characters.len(),
            "catalog loaded from {}",
            data_dir.display()
        );
        (Self { gifts, characters }, errors)
    }
}

pub fn load_gifts(path: impl AsRef<Path>) -> Result<Vec<Gift>, CatalogLoadError> {
    let definitions: Vec<GiftDefinition> = read_json(path.as_ref())?;

    let mut seen = HashSet::new();
    for def in &definitions {
        if !seen.insert(def.id) {
            return Err(CatalogLoadError::DuplicateGiftId(def.id));
        }
    }

    Ok(definitions.into_iter().map(Gift::from).collect())
}

pub fn load_characters(path: impl AsRef<Path>) -> Result<Vec<Character>, CatalogLoadError> {
    read_json(path.as_ref())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, CatalogLoadError> {
    let bytes = fs::read(path).map_err(|source| CatalogLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| CatalogLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
