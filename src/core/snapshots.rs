//! Remote catalog snapshots
//!
//! Shapes of the records the sync collaborator fetches from the server. Converting a snapshot
//! into its row normalises timestamps to storage precision, so mirroring the same snapshot twice
//! compares equal to what is already stored.

use crate::db::models::{
    storage_precision, Book, Collection, Library, ReadList, ReadProgress, Series,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    pub name: String,
    pub server_url: String,
    pub username: String,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibrarySnapshot {
    pub id: String,
    pub name: String,
}

impl LibrarySnapshot {
    pub fn into_row(self, instance_id: &str) -> Library {
        Library {
            instance_id: instance_id.to_string(),
            library_id: self.id,
            name: self.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesSnapshot {
    pub id: String,
    pub library_id: String,
    pub name: String,
    #[serde(default)]
    pub url: String,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub books_count: i64,
    #[serde(default)]
    pub books_read_count: i64,
    #[serde(default)]
    pub books_unread_count: i64,
    #[serde(default)]
    pub books_in_progress_count: i64,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub books_metadata: serde_json::Value,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub oneshot: bool,
}

impl SeriesSnapshot {
    pub fn into_row(self, instance_id: &str) -> Series {
        Series {
            instance_id: instance_id.to_string(),
            series_id: self.id,
            library_id: self.library_id,
            name: self.name,
            url: self.url,
            created: storage_precision(self.created),
            last_modified: storage_precision(self.last_modified),
            books_count: self.books_count,
            books_read_count: self.books_read_count,
            books_unread_count: self.books_unread_count,
            books_in_progress_count: self.books_in_progress_count,
            metadata: self.metadata,
            books_metadata: self.books_metadata,
            deleted: self.deleted,
            oneshot: self.oneshot,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadProgressSnapshot {
    pub page: i64,
    pub completed: bool,
    #[serde(default)]
    pub read_date: Option<DateTime<Utc>>,
    pub last_modified: DateTime<Utc>,
}

impl ReadProgressSnapshot {
    fn into_progress(self) -> ReadProgress {
        ReadProgress {
            page: self.page,
            completed: self.completed,
            read_date: self.read_date.map(storage_precision),
            last_modified: storage_precision(self.last_modified),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookSnapshot {
    pub id: String,
    pub series_id: String,
    pub library_id: String,
    pub name: String,
    #[serde(default)]
    pub url: String,
    pub number: f64,
    pub number_sort: f64,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub size_bytes: i64,
    #[serde(default)]
    pub media: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub read_progress: Option<ReadProgressSnapshot>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub oneshot: bool,
    #[serde(default)]
    pub series_title: String,
}

impl BookSnapshot {
    pub fn into_row(self, instance_id: &str) -> Book {
        Book {
            instance_id: instance_id.to_string(),
            book_id: self.id,
            series_id: self.series_id,
            library_id: self.library_id,
            name: self.name,
            url: self.url,
            number: self.number,
            number_sort: self.number_sort,
            created: storage_precision(self.created),
            last_modified: storage_precision(self.last_modified),
            size_bytes: self.size_bytes,
            media: self.media,
            metadata: self.metadata,
            read_progress: self.read_progress.map(ReadProgressSnapshot::into_progress),
            deleted: self.deleted,
            oneshot: self.oneshot,
            series_title: self.series_title,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSnapshot {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub ordered: bool,
    #[serde(default)]
    pub filtered: bool,
    pub created_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
    #[serde(default)]
    pub series_ids: Vec<String>,
}

impl CollectionSnapshot {
    pub fn into_row(self, instance_id: &str) -> Collection {
        Collection {
            instance_id: instance_id.to_string(),
            collection_id: self.id,
            name: self.name,
            ordered: self.ordered,
            filtered: self.filtered,
            created_date: storage_precision(self.created_date),
            last_modified_date: storage_precision(self.last_modified_date),
            series_ids: self.series_ids,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadListSnapshot {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub ordered: bool,
    #[serde(default)]
    pub filtered: bool,
    pub created_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
    #[serde(default)]
    pub book_ids: Vec<String>,
}

impl ReadListSnapshot {
    pub fn into_row(self, instance_id: &str) -> ReadList {
        ReadList {
            instance_id: instance_id.to_string(),
            read_list_id: self.id,
            name: self.name,
            summary: self.summary,
            ordered: self.ordered,
            filtered: self.filtered,
            created_date: storage_precision(self.created_date),
            last_modified_date: storage_precision(self.last_modified_date),
            book_ids: self.book_ids,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_book_snapshot_from_remote_json() {
        let json = r#"{
            "id": "0B1",
            "seriesId": "0S1",
            "libraryId": "L1",
            "name": "Chapter 1",
            "number": 1,
            "numberSort": 1.5,
            "created": "2024-03-01T10:00:00.123456789Z",
            "lastModified": "2024-03-02T10:00:00Z",
            "sizeBytes": 52428800,
            "media": {"status": "READY", "pagesCount": 24},
            "readProgress": {"page": 12, "completed": false, "lastModified": "2024-03-03T08:00:00Z"}
        }"#;

        let snapshot: BookSnapshot = serde_json::from_str(json).unwrap();
        let book = snapshot.into_row("inst");

        assert_eq!(book.key().to_string(), "inst/0B1");
        assert_eq!(book.number_sort, 1.5);
        assert_eq!(book.created.timestamp_subsec_nanos(), 123_000_000);
        assert_eq!(book.read_progress.as_ref().map(|p| p.page), Some(12));
        assert!(!book.deleted);
        assert_eq!(book.media["pagesCount"], 24);
    }

    #[test]
    fn test_series_snapshot_defaults() {
        let json = r#"{
            "id": "0S1",
            "libraryId": "L1",
            "name": "Series",
            "created": "2024-03-01T10:00:00Z",
            "lastModified": "2024-03-01T10:00:00Z",
            "booksCount": 10,
            "booksUnreadCount": 10
        }"#;
        let series: SeriesSnapshot = serde_json::from_str(json).unwrap();
        let row = series.into_row("inst");
        assert_eq!(row.books_count, 10);
        assert_eq!(row.books_read_count, 0);
        assert_eq!(row.metadata, serde_json::Value::Null);
    }
}
