//! Game logic for the wish oracle: which gifts exist, which have been
//! revealed, who narrates each reveal, and the snapshot that survives restarts.

pub mod catalog;
pub mod game;
pub mod matcher;
pub mod model;
pub mod progress;
pub mod selector;

pub use catalog::{Catalog, CatalogLoadError};
pub use game::{GameLogic, ResetError, RevealError, Revealed, PROGRESS_FILE};
pub use matcher::{best_match, match_score};
pub use model::{Character, Gift, GiftId, GiftState, SelectionMode, Session, Summary};
pub use progress::{
    LoadStatus, PersistenceError, ProgressLoadError, ProgressSnapshot, ProgressStore, RevealRecord,
};
pub use selector::select_next;
