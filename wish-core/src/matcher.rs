//! Character matching.
//!
//! Every character is scored against a gift:
//! * +2 for each (theme, keyword) pair where one contains the other,
//! * +5 when the character's name appears in the description,
//! * +3 for each theme containing the character's name.
//!
//! All comparisons are case-insensitive. The highest score wins and ties go to
//! the character listed first. When nobody scores, a looser name/theme pass
//! runs, and failing that a random character is chosen.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::model::{Character, Gift};

pub fn match_score(gift: &Gift, character: &Character) -> u32 {
    let themes: Vec<String> = gift.themes.iter().map(|t| t.to_lowercase()).collect();
    let name = character.name.to_lowercase();
    let mut score = 0;

    for theme in &themes {
        for keyword in &character.match_keywords {
            let keyword = keyword.to_lowercase();
            if theme.contains(&keyword) || keyword.contains(theme.as_str()) {
                score += 2;
            }
        }
    }

    if gift.description.to_lowercase().contains(&name) {
        score += 5;
    }

    for theme in &themes {
        if theme.contains(&name) {
            score += 3;
        }
    }

    score
}

pub fn best_match<R: Rng + ?Sized>(gift: &Gift, characters: &[Character], rng: &mut R) -> Character {
    let mut best: Option<&Character> = None;
    let mut best_score = 0;
    for character in characters {
        let score = match_score(gift, character);
        if score > best_score {
            best_score = score;
            best = Some(character);
        }
    }

    if let Some(character) = best {
        return character.clone();
    }

    if let Some(character) = loose_name_match(gift, characters) {
        return character.clone();
    }

    characters
        .choose(rng)
        .cloned()
        .unwrap_or_else(Character::fallback)
}

fn loose_name_match<'a>(gift: &Gift, characters: &'a [Character]) -> Option<&'a Character> {
    characters.iter().find(|character| {
        let name = character.name.to_lowercase();
        gift.themes.iter().any(|theme| {
            let theme = theme.to_lowercase();
            name.contains(&theme) || theme.contains(&name)
        })
    })
}
