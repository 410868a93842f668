//! The game facade: owns gifts and session state and is the only writer of
//! persisted progress.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use crate::catalog::{Catalog, CatalogLoadError};
use crate::matcher;
use crate::model::{Character, Gift, GiftId, GiftState, SelectionMode, Session, Summary};
use crate::progress::{LoadStatus, PersistenceError, ProgressStore};
use crate::selector;

pub const PROGRESS_FILE: &str = "progress.json";

#[derive(Debug, Error)]
pub enum RevealError {
    #[error("gift {0} not found")]
    NotFound(GiftId),
    #[error("gift {id} already revealed")]
    AlreadyRevealed {
        id: GiftId,
        revealed_at: DateTime<Utc>,
        revealed_by: String,
    },
    #[error("reveal not saved: {0}")]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Error)]
#[error("reset incomplete: {0}")]
pub struct ResetError(#[from] pub PersistenceError);

/// A gift that was just revealed together with the character credited for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revealed {
    pub gift: Gift,
    pub character: Character,
}

struct GameState {
    gifts: Vec<Gift>,
    session: Session,
    rng: ChaCha8Rng,
}

impl GameState {
    fn position(&self, gift_id: GiftId) -> Option<usize> {
        self.gifts.iter().position(|g| g.id == gift_id)
    }

    fn revealed_count(&self) -> usize {
        self.gifts.iter().filter(|g| g.is_revealed()).count()
    }
}

pub struct GameLogic {
    characters: Vec<Character>,
    store: ProgressStore,
    load_status: LoadStatus,
    catalog_errors: Vec<CatalogLoadError>,
    state: Mutex<GameState>,
}

impl GameLogic {
    pub fn new(catalog: Catalog, store: ProgressStore) -> Self {
        Self::with_rng(catalog, store, ChaCha8Rng::from_entropy())
    }

    /// Same as [`GameLogic::new`] but with a reproducible random source.
    pub fn with_seed(catalog: Catalog, store: ProgressStore, seed: u64) -> Self {
        Self::with_rng(catalog, store, ChaCha8Rng::seed_from_u64(seed))
    }

    /// Loads the catalog from `data_dir` and progress from `data_dir/progress.json`.
    pub fn open(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        let (catalog, errors) = Catalog::load(data_dir);
        Self::new(catalog, ProgressStore::new(data_dir.join(PROGRESS_FILE)))
            .with_catalog_errors(errors)
    }

    fn with_rng(catalog: Catalog, store: ProgressStore, rng: ChaCha8Rng) -> Self {
        let Catalog {
            mut gifts,
            characters,
        } = catalog;
        let mut session = Session::default();
        let load_status = store.load(&mut session, &mut gifts);

        Self {
            characters,
            store,
            load_status,
            catalog_errors: Vec::new(),
            state: Mutex::new(GameState {
                gifts,
                session,
                rng,
            }),
        }
    }

    pub fn with_catalog_errors(mut self, errors: Vec<CatalogLoadError>) -> Self {
        self.catalog_errors = errors;
        self
    }

    fn lock(&self) -> MutexGuard<'_, GameState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn load_status(&self) -> &LoadStatus {
        &self.load_status
    }

    pub fn catalog_errors(&self) -> &[CatalogLoadError] {
        &self.catalog_errors
    }

    pub fn characters(&self) -> &[Character] {
        &self.characters
    }

    pub fn gifts(&self) -> Vec<Gift> {
        self.lock().gifts.clone()
    }

    pub fn available_gifts(&self) -> Vec<Gift> {
        self.lock()
            .gifts
            .iter()
            .filter(|g| !g.is_revealed())
            .cloned()
            .collect()
    }

    pub fn revealed_gifts(&self) -> Vec<Gift> {
        self.lock()
            .gifts
            .iter()
            .filter(|g| g.is_revealed())
            .cloned()
            .collect()
    }

    /// Gifts revealed strictly after `since`, oldest first.
    pub fn recent_reveals(&self, since: DateTime<Utc>) -> Vec<Gift> {
        let mut recent: Vec<Gift> = self
            .lock()
            .gifts
            .iter()
            .filter(|g| g.revealed_at().is_some_and(|at| at > since))
            .cloned()
            .collect();
        recent.sort_by_key(|g| g.revealed_at());
        recent
    }

    pub fn find_by_id(&self, gift_id: GiftId) -> Option<Gift> {
        self.lock().gifts.iter().find(|g| g.id == gift_id).cloned()
    }

    pub fn find_character_by_name(&self, name: &str) -> Option<&Character> {
        let name = name.to_lowercase();
        self.characters
            .iter()
            .find(|c| c.name.to_lowercase() == name)
    }

    pub fn session(&self) -> Session {
        self.lock().session.clone()
    }

    pub fn mode(&self) -> SelectionMode {
        self.lock().session.mode
    }

    pub fn rotation_index(&self) -> u32 {
        self.lock().session.rotation_index
    }

    pub fn summary(&self) -> Summary {
        let state = self.lock();
        Summary::from_counts(state.gifts.len(), state.session.total_revealed as usize)
    }

    /// Next gift to reveal under `mode` (or the session's mode), without revealing it.
    pub fn select_next(&self, mode: Option<SelectionMode>) -> Option<Gift> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let mode = mode.unwrap_or(state.session.mode);
        selector::select_next(&state.gifts, mode, &mut state.rng).cloned()
    }

    pub fn best_match(&self, gift: &Gift) -> Character {
        let mut state = self.lock();
        matcher::best_match(gift, &self.characters, &mut state.rng)
    }

    /// Reveals `gift_id` on behalf of `character` and persists the result.
    /// Only the first reveal of a gift succeeds; if the snapshot cannot be
    /// written the reveal is undone.
    pub fn reveal(&self, gift_id: GiftId, character: &Character) -> Result<Gift, RevealError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let index = state
            .position(gift_id)
            .ok_or(RevealError::NotFound(gift_id))?;

        if let GiftState::Revealed {
            revealed_at,
            revealed_by,
        } = &state.gifts[index].state
        {
            return Err(RevealError::AlreadyRevealed {
                id: gift_id,
                revealed_at: *revealed_at,
                revealed_by: revealed_by.clone(),
            });
        }

        self.commit_reveal(state, index, character)
    }

    /// Selects, matches and reveals in one step. The first unrevealed id in
    /// `preferred` wins over the selector. `Ok(None)` means every gift is revealed.
    pub fn reveal_next(
        &self,
        mode: Option<SelectionMode>,
        preferred: &[GiftId],
    ) -> Result<Option<Revealed>, RevealError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let mode = mode.unwrap_or(state.session.mode);

        let chosen = preferred
            .iter()
            .find_map(|id| {
                state
                    .gifts
                    .iter()
                    .find(|g| g.id == *id && !g.is_revealed())
                    .map(|g| g.id)
            })
            .or_else(|| selector::select_next(&state.gifts, mode, &mut state.rng).map(|g| g.id));

        let Some(gift_id) = chosen else {
            return Ok(None);
        };
        let index = state
            .position(gift_id)
            .ok_or(RevealError::NotFound(gift_id))?;
        let character = matcher::best_match(&state.gifts[index], &self.characters, &mut state.rng);
        let gift = self.commit_reveal(state, index, &character)?;
        Ok(Some(Revealed { gift, character }))
    }

    fn commit_reveal(
        &self,
        state: &mut GameState,
        index: usize,
        character: &Character,
    ) -> Result<Gift, RevealError> {
        let now = Utc::now();
        state.gifts[index].state = GiftState::Revealed {
            revealed_at: now,
            revealed_by: character.name.clone(),
        };
        state.session.total_revealed += 1;

        match self.store.save(&state.session, &state.gifts, now) {
            Ok(_) => {
                state.session.last_played = Some(now);
                let gift = state.gifts[index].clone();
                tracing::info!(gift_id = gift.id, character = %character.name, "gift revealed");
                debug_assert_eq!(state.session.total_revealed as usize, state.revealed_count());
                Ok(gift)
            }
            Err(err) => {
                state.gifts[index].state = GiftState::Unrevealed;
                state.session.total_revealed -= 1;
                tracing::error!(gift_id = state.gifts[index].id, "error revealing gift: {err}");
                Err(err.into())
            }
        }
    }

    pub fn set_mode(&self, mode: SelectionMode) -> Result<(), PersistenceError> {
        self.update_session(
            |session| std::mem::replace(&mut session.mode, mode),
            |session, old| session.mode = old,
        )
    }

    /// Records the call-profile rotation position handed back by the call collaborator.
    pub fn set_rotation_index(&self, rotation_index: u32) -> Result<(), PersistenceError> {
        self.update_session(
            |session| std::mem::replace(&mut session.rotation_index, rotation_index),
            |session, old| session.rotation_index = old,
        )
    }

    /// Hands out the current call-profile position and persists the next one
    /// in the same step, so overlapping calls never share a profile. With no
    /// profiles the position stays where it is.
    pub fn advance_rotation(&self, profile_count: usize) -> Result<u32, PersistenceError> {
        let mut reserved = 0;
        self.update_session(
            |session| {
                reserved = session.rotation_index;
                let next = match u32::try_from(profile_count) {
                    Ok(0) | Err(_) => reserved,
                    Ok(count) => reserved.wrapping_add(1) % count,
                };
                std::mem::replace(&mut session.rotation_index, next)
            },
            |session, old| session.rotation_index = old,
        )?;
        Ok(reserved)
    }

    fn update_session<T>(
        &self,
        apply: impl FnOnce(&mut Session) -> T,
        undo: impl FnOnce(&mut Session, T),
    ) -> Result<(), PersistenceError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let previous = apply(&mut state.session);
        let now = Utc::now();
        match self.store.save(&state.session, &state.gifts, now) {
            Ok(_) => {
                state.session.last_played = Some(now);
                Ok(())
            }
            Err(err) => {
                undo(&mut state.session, previous);
                tracing::error!("error saving session settings: {err}");
                Err(err)
            }
        }
    }

    /// Returns every gift to unrevealed, resets the session and deletes the
    /// snapshot. In-memory state is reset even when the delete fails.
    pub fn reset(&self) -> Result<(), ResetError> {
        let mut state = self.lock();
        for gift in state.gifts.iter_mut() {
            gift.state = GiftState::Unrevealed;
        }
        state.session = Session::default();

        match self.store.clear() {
            Ok(()) => {
                tracing::info!("game reset");
                Ok(())
            }
            Err(err) => {
                tracing::error!("error resetting game: {err}");
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn character(name: &str, keywords: &[&str]) -> Character {
        Character {
            name: name.to_string(),
            image_path: String::new(),
            personality: format!("{name} personality"),
            match_keywords: keywords.iter().map(|k| k.to_string()).collect(),
            voice_style: "warm".to_string(),
        }
    }

    fn catalog(ids: impl IntoIterator<Item = GiftId>) -> Catalog {
        Catalog::new(
            ids.into_iter()
                .map(|id| Gift::new(id, format!("gift {id}"), vec!["magic".into()], ""))
                .collect(),
            vec![
                character("Mickey Mouse", &["disney", "magic"]),
                character("Baymax", &["robot"]),
            ],
        )
    }

    fn game(dir: &TempDir, ids: impl IntoIterator<Item = GiftId>) -> GameLogic {
        GameLogic::with_seed(
            catalog(ids),
            ProgressStore::new(dir.path().join(PROGRESS_FILE)),
            42,
        )
    }

    fn assert_counter_consistent(logic: &GameLogic) {
        let session = logic.session();
        assert_eq!(session.total_revealed as usize, logic.revealed_gifts().len());
    }

    #[test]
    fn reveal_updates_counter_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let logic = game(&dir, 1..=5);
        let mickey = character("Mickey Mouse", &[]);

        for id in [3, 1, 5] {
            let gift = logic.reveal(id, &mickey).unwrap();
            assert!(gift.is_revealed());
            assert_eq!(gift.revealed_by(), Some("Mickey Mouse"));
            assert_counter_consistent(&logic);
        }

        let summary = logic.summary();
        assert_eq!(summary.revealed, 3);
        assert_eq!(summary.remaining, 2);
        assert_eq!(summary.percent_complete, 60.0);
        assert!(!summary.is_complete);
        assert!(logic.session().last_played.is_some());

        let reloaded = game(&dir, 1..=5);
        assert_eq!(reloaded.session().total_revealed, 3);
        assert_eq!(reloaded.revealed_gifts(), logic.revealed_gifts());
    }

    #[test]
    fn second_reveal_is_a_conflict_and_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let logic = game(&dir, 1..=3);
        let first = logic.reveal(2, &character("Stitch", &[])).unwrap();

        for _ in 0..3 {
            let err = logic.reveal(2, &character("Olaf", &[])).unwrap_err();
            match err {
                RevealError::AlreadyRevealed {
                    id,
                    revealed_at,
                    revealed_by,
                } => {
                    assert_eq!(id, 2);
                    assert_eq!(Some(revealed_at), first.revealed_at());
                    assert_eq!(revealed_by, "Stitch");
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(logic.find_by_id(2), Some(first));
        assert_eq!(logic.session().total_revealed, 1);
    }

    #[test]
    fn unknown_gift_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let logic = game(&dir, 1..=3);
        let err = logic.reveal(31, &Character::fallback()).unwrap_err();
        assert!(matches!(err, RevealError::NotFound(31)));
        assert!(logic.find_by_id(31).is_none());
    }

    #[test]
    fn failed_save_rolls_back_the_reveal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "file, not a directory").unwrap();
        let logic = GameLogic::with_seed(
            catalog(1..=3),
            ProgressStore::new(blocker.join(PROGRESS_FILE)),
            1,
        );

        let err = logic.reveal(1, &Character::fallback()).unwrap_err();
        assert!(matches!(err, RevealError::Persistence(_)));
        assert!(!logic.find_by_id(1).unwrap().is_revealed());
        assert_eq!(logic.session().total_revealed, 0);
        assert!(logic.session().last_played.is_none());

        assert!(logic.set_mode(SelectionMode::Sequential).is_err());
        assert_eq!(logic.mode(), SelectionMode::Random);
    }

    #[test]
    fn reset_clears_everything() {
        let dir = tempfile::tempdir().unwrap();
        let logic = game(&dir, 1..=3);
        for id in 1..=3 {
            logic.reveal(id, &Character::fallback()).unwrap();
        }
        logic.set_mode(SelectionMode::Sequential).unwrap();
        logic.set_rotation_index(1).unwrap();
        assert!(logic.summary().is_complete);

        logic.reset().unwrap();

        assert!(logic
            .gifts()
            .iter()
            .all(|g| g.state == GiftState::Unrevealed && g.revealed_at().is_none()));
        assert_eq!(logic.session(), Session::default());
        assert!(!logic.summary().is_complete);
        assert!(!dir.path().join(PROGRESS_FILE).exists());
        assert_counter_consistent(&logic);

        // Resetting twice is fine: there is no snapshot left to delete.
        logic.reset().unwrap();
    }

    #[test]
    fn failed_snapshot_delete_still_resets_memory() {
        let dir = tempfile::tempdir().unwrap();
        let logic = game(&dir, 1..=3);
        logic.reveal(1, &Character::fallback()).unwrap();
        logic.set_rotation_index(1).unwrap();

        let snapshot = dir.path().join(PROGRESS_FILE);
        fs::remove_file(&snapshot).unwrap();
        fs::create_dir(&snapshot).unwrap();
        fs::write(snapshot.join("keep"), "x").unwrap();

        let err = logic.reset().unwrap_err();
        assert!(matches!(err, ResetError(PersistenceError::Remove { .. })));
        assert!(logic.revealed_gifts().is_empty());
        assert_eq!(logic.session(), Session::default());
        assert!(snapshot.is_dir());
    }

    #[test]
    fn advance_rotation_reserves_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let logic = game(&dir, 1..=2);

        assert_eq!(logic.advance_rotation(3).unwrap(), 0);
        assert_eq!(logic.advance_rotation(3).unwrap(), 1);
        assert_eq!(logic.advance_rotation(3).unwrap(), 2);
        assert_eq!(logic.rotation_index(), 0);

        logic.set_rotation_index(1).unwrap();
        assert_eq!(logic.advance_rotation(0).unwrap(), 1);
        assert_eq!(logic.rotation_index(), 1);

        assert_eq!(logic.advance_rotation(2).unwrap(), 1);
        assert_eq!(game(&dir, 1..=2).rotation_index(), 0);
    }

    #[test]
    fn concurrent_rotation_advances_hand_out_distinct_positions() {
        let dir = tempfile::tempdir().unwrap();
        let logic = game(&dir, 1..=2);

        let mut reserved: Vec<u32> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let logic = &logic;
                    scope.spawn(move || logic.advance_rotation(4).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        reserved.sort();
        assert_eq!(reserved, vec![0, 1, 2, 3]);
        assert_eq!(logic.rotation_index(), 0);
    }

    #[test]
    fn empty_catalog_summary() {
        let dir = tempfile::tempdir().unwrap();
        let logic = GameLogic::with_seed(
            Catalog::default(),
            ProgressStore::new(dir.path().join(PROGRESS_FILE)),
            5,
        );
        let summary = logic.summary();
        assert_eq!(summary.total, 0);
        assert_eq!(summary.percent_complete, 0.0);
        assert!(summary.is_complete);
        assert!(logic.select_next(None).is_none());
        assert!(logic.reveal_next(None, &[]).unwrap().is_none());
        assert_eq!(logic.best_match(&Gift::new(1, "x", vec![], "")), Character::fallback());
    }

    #[test]
    fn reveal_next_walks_sequentially_until_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let logic = game(&dir, [12, 3, 7]);
        logic.set_mode(SelectionMode::Sequential).unwrap();

        let mut order = Vec::new();
        while let Some(revealed) = logic.reveal_next(None, &[]).unwrap() {
            assert_eq!(revealed.character.name, "Mickey Mouse");
            order.push(revealed.gift.id);
            assert_counter_consistent(&logic);
        }
        assert_eq!(order, vec![3, 7, 12]);
        assert!(logic.select_next(Some(SelectionMode::Random)).is_none());
    }

    #[test]
    fn reveal_next_prefers_listed_ids() {
        let dir = tempfile::tempdir().unwrap();
        let logic = game(&dir, 1..=30);
        logic.reveal(28, &Character::fallback()).unwrap();

        let revealed = logic
            .reveal_next(Some(SelectionMode::Sequential), &[28, 24, 19])
            .unwrap()
            .unwrap();
        assert_eq!(revealed.gift.id, 24);

        let revealed = logic
            .reveal_next(Some(SelectionMode::Sequential), &[28, 24])
            .unwrap()
            .unwrap();
        assert_eq!(revealed.gift.id, 1);
    }

    #[test]
    fn concurrent_reveals_of_one_gift_succeed_once() {
        let dir = tempfile::tempdir().unwrap();
        let logic = game(&dir, 1..=30);
        let before = logic.session().total_revealed;

        let results: Vec<Result<Gift, RevealError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let logic = &logic;
                    scope.spawn(move || logic.reveal(7, &character(&format!("caller {i}"), &[])))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let successes = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(RevealError::AlreadyRevealed { .. })))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(conflicts, 15);
        assert_eq!(logic.session().total_revealed, before + 1);
        assert_counter_consistent(&logic);
    }

    #[test]
    fn lookups_are_case_insensitive_and_total() {
        let dir = tempfile::tempdir().unwrap();
        let logic = game(&dir, 1..=2);
        assert_eq!(
            logic.find_character_by_name("mickey MOUSE").map(|c| c.name.as_str()),
            Some("Mickey Mouse")
        );
        assert!(logic.find_character_by_name("Goofy").is_none());
        assert_eq!(logic.find_by_id(2).map(|g| g.id), Some(2));
    }

    #[test]
    fn recent_reveals_respects_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let logic = game(&dir, 1..=3);
        logic.reveal(1, &Character::fallback()).unwrap();
        let cutoff = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        logic.reveal(2, &Character::fallback()).unwrap();

        let recent: Vec<GiftId> = logic.recent_reveals(cutoff).iter().map(|g| g.id).collect();
        assert_eq!(recent, vec![2]);
    }

    #[test]
    fn rotation_index_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let logic = game(&dir, 1..=2);
        logic.set_rotation_index(1).unwrap();
        assert_eq!(game(&dir, 1..=2).rotation_index(), 1);
    }

    #[test]
    fn open_reads_catalog_from_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(crate::catalog::GIFTS_FILE),
            r#"[{"id": 1, "description": "Ears", "themes": ["mickey"], "image_path": ""}]"#,
        )
        .unwrap();

        let logic = GameLogic::open(dir.path());
        assert_eq!(logic.gifts().len(), 1);
        assert!(logic.characters().is_empty());
        assert_eq!(logic.catalog_errors().len(), 1);
        assert!(matches!(logic.load_status(), LoadStatus::NoSnapshot));
    }
}
