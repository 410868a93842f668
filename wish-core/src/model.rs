use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type GiftId = u32;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum GiftState {
    Unrevealed,
    Revealed {
        revealed_at: DateTime<Utc>,
        revealed_by: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Gift {
    pub id: GiftId,
    pub description: String,
    pub themes: Vec<String>,
    pub image_path: String,
    pub state: GiftState,
}

impl Gift {
    pub fn new(
        id: GiftId,
        description: impl Into<String>,
        themes: Vec<String>,
        image_path: impl Into<String>,
    ) -> Self {
        Self {
            id,
            description: description.into(),
            themes,
            image_path: image_path.into(),
            state: GiftState::Unrevealed,
        }
    }

    pub fn is_revealed(&self) -> bool {
        matches!(self.state, GiftState::Revealed { .. })
    }

    pub fn revealed_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            GiftState::Revealed { revealed_at, .. } => Some(*revealed_at),
            GiftState::Unrevealed => None,
        }
    }

    pub fn revealed_by(&self) -> Option<&str> {
        match &self.state {
            GiftState::Revealed { revealed_by, .. } => Some(revealed_by.as_str()),
            GiftState::Unrevealed => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Character {
    pub name: String,
    #[serde(default)]
    pub image_path: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub match_keywords: Vec<String>,
    #[serde(default)]
    pub voice_style: String,
}

impl Character {
    /// Stand-in narrator used when the character catalog is empty.
    pub fn fallback() -> Self {
        Self {
            name: "Mickey Mouse".to_string(),
            image_path: "assets/mickey.png".to_string(),
            personality: "Cheerful Disney icon".to_string(),
            match_keywords: Vec::new(),
            voice_style: "Upbeat and magical".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    #[default]
    Random,
    Sequential,
}

impl std::str::FromStr for SelectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "random" => Ok(SelectionMode::Random),
            "sequential" => Ok(SelectionMode::Sequential),
            other => Err(format!("unknown selection mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub total_revealed: u32,
    pub last_played: Option<DateTime<Utc>>,
    pub mode: SelectionMode,
    pub rotation_index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Summary {
    pub total: usize,
    pub revealed: usize,
    pub remaining: usize,
    pub percent_complete: f64,
    pub is_complete: bool,
}

impl Summary {
    pub fn from_counts(total: usize, revealed: usize) -> Self {
        let percent_complete = if total == 0 {
            0.0
        } else {
            revealed as f64 / total as f64 * 100.0
        };
        Self {
            total,
            revealed,
            remaining: total.saturating_sub(revealed),
            percent_complete,
            is_complete: revealed >= total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reveal_fields_follow_state() {
        let mut gift = Gift::new(1, "A mickey hat", vec!["mickey".into()], "hat.png");
        assert!(!gift.is_revealed());
        assert_eq!(gift.revealed_at(), None);
        assert_eq!(gift.revealed_by(), None);

        let at = Utc::now();
        gift.state = GiftState::Revealed {
            revealed_at: at,
            revealed_by: "Stitch".into(),
        };
        assert!(gift.is_revealed());
        assert_eq!(gift.revealed_at(), Some(at));
        assert_eq!(gift.revealed_by(), Some("Stitch"));
    }

    #[test]
    fn summary_of_empty_catalog_avoids_division() {
        let summary = Summary::from_counts(0, 0);
        assert_eq!(summary.percent_complete, 0.0);
        assert!(summary.is_complete);
        assert_eq!(summary.remaining, 0);
    }

    #[test]
    fn summary_percentages() {
        let summary = Summary::from_counts(30, 15);
        assert_eq!(summary.remaining, 15);
        assert_eq!(summary.percent_complete, 50.0);
        assert!(!summary.is_complete);
    }

    #[test]
    fn selection_mode_parses_case_insensitively() {
        assert_eq!("Sequential".parse::<SelectionMode>(), Ok(SelectionMode::Sequential));
        assert_eq!(" random ".parse::<SelectionMode>(), Ok(SelectionMode::Random));
        assert!("shuffle".parse::<SelectionMode>().is_err());
        assert_eq!(
            serde_json::to_string(&SelectionMode::Sequential).unwrap(),
            "\"sequential\""
        );
    }
}
