use rand::seq::SliceRandom;
use rand::Rng;

use crate::model::{Gift, SelectionMode};

/// Picks the next gift to reveal. Returns `None` once every gift is revealed.
pub fn select_next<'a, R: Rng + ?Sized>(
    gifts: &'a [Gift],
    mode: SelectionMode,
    rng: &mut R,
) -> Option<&'a Gift> {
    match mode {
        SelectionMode::Sequential => gifts
            .iter()
            .filter(|g| !g.is_revealed())
            .min_by_key(|g| g.id),
        SelectionMode::Random => {
            let eligible: Vec<&Gift> = gifts.iter().filter(|g| !g.is_revealed()).collect();
            eligible.choose(rng).copied()
        }
    }
}
