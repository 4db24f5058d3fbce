//! Reading progress outbox
//!
//! Reading positions are queued locally and uploaded by the sync collaborator. There is at most
//! one live entry per book: a newer position overwrites the queued one and takes a fresh id.

use crate::core::aggregates::{self, ReadingState};
use crate::core::error::{MirrorError, Result};
use crate::core::session::WriteSession;
use crate::db::models::{EntityKey, PendingProgress, ReadProgress};
use crate::db::repository::{BookRepository, ProgressRepository};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// A reading position reported by the reader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub instance_id: String,
    pub book_id: String,
    pub page: i64,
    pub completed: bool,
    #[serde(default)]
    pub progression: Option<Vec<u8>>,
}

impl ProgressUpdate {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.instance_id, &self.book_id)
    }
}

impl WriteSession<'_> {
    /// Queue a reading position and apply it to the mirrored book
    pub fn record_progress(&mut self, update: &ProgressUpdate) -> Result<PendingProgress> {
        if update.page < 0 {
            return Err(MirrorError::ValidationError(format!(
                "negative page {} for book {}",
                update.page, update.book_id
            )));
        }

        let outbox = ProgressRepository::new(self.conn());
        let created_at = match outbox.latest_created_at()? {
            Some(latest) if latest >= self.now() => latest + chrono::Duration::milliseconds(1),
            _ => self.now(),
        };

        let entry = PendingProgress {
            id: Uuid::new_v4().to_string(),
            instance_id: update.instance_id.clone(),
            book_id: update.book_id.clone(),
            page: update.page,
            completed: update.completed,
            created_at,
            progression: update.progression.clone(),
        };
        outbox.save(&entry)?;

        let key = update.key();
        let books = BookRepository::new(self.conn());
        let Some(book) = books.find(&key)? else {
            debug!(book = %key, "Progress queued for a book that is not mirrored");
            return Ok(entry);
        };

        let read_date = if update.completed {
            book.read_progress.as_ref().and_then(|p| p.read_date).or(Some(self.now()))
        } else {
            None
        };
        let progress = ReadProgress {
            page: update.page,
            completed: update.completed,
            read_date,
            last_modified: self.now(),
        };
        books.set_read_progress(&key, &progress)?;

        let old = ReadingState::of(book.read_progress.as_ref());
        let new = ReadingState::of(Some(&progress));
        let series_key = book.series_key();
        aggregates::propagate_reading(self.conn(), &series_key, old, new)?;
        self.evaluate_series(&series_key)?;

        debug!(book = %key, page = update.page, completed = update.completed, "Progress recorded");
        Ok(entry)
    }
}
