//! Store writer
//!
//! A dedicated thread owns the only read-write connection. Jobs arrive over a bounded channel and
//! run one at a time; each caller awaits its own reply. A job that panics is reported to its caller
//! and the writer keeps serving.

use crate::core::error::{MirrorError, Result};
use rusqlite::Connection;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

type Job = Box<dyn FnOnce(&mut Connection) + Send>;

/// Handle to the writer thread
#[derive(Clone)]
pub struct StoreWriter {
    sender: mpsc::Sender<Job>,
}

impl StoreWriter {
    /// Move `conn` onto a new writer thread
    pub fn spawn(conn: Connection, queue_depth: usize) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>(queue_depth.max(1));
        std::thread::Builder::new()
            .name("shelf-mirror-writer".to_string())
            .spawn(move || run(conn, receiver))?;
        Ok(Self { sender })
    }

    /// Run `f` on the writer connection and wait for its result
    pub async fn submit<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let job: Job = Box::new(move |conn| {
            let result = match panic::catch_unwind(AssertUnwindSafe(|| f(conn))) {
                Ok(result) => result,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(panic = %message, "Writer job panicked");
                    Err(MirrorError::TaskError(format!("Writer job panicked: {}", message)))
                }
            };
            // The caller may have stopped waiting
            let _ = reply.send(result);
        });

        self.sender.send(job).await.map_err(|_| MirrorError::WriterClosed)?;
        response.await.map_err(|_| MirrorError::WriterClosed)?
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

fn run(mut conn: Connection, mut receiver: mpsc::Receiver<Job>) {
    info!("Store writer started");
    while let Some(job) = receiver.blocking_recv() {
        job(&mut conn);
    }
    info!("Store writer stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer() -> StoreWriter {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (v INTEGER NOT NULL);").unwrap();
        StoreWriter::spawn(conn, 4).unwrap()
    }

    #[tokio::test]
    async fn test_jobs_run_in_order() {
        let writer = writer();
        for v in 1..=3 {
            writer
                .submit(move |conn| {
                    conn.execute("INSERT INTO t (v) VALUES (?1)", [v])?;
                    Ok(())
                })
                .await
                .unwrap();
        }

        let values: Vec<i64> = writer
            .submit(|conn| {
                let mut stmt = conn.prepare("SELECT v FROM t ORDER BY rowid")?;
                let values = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<i64>, _>>()?;
                Ok(values)
            })
            .await
            .unwrap();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_panicking_job_is_reported_and_writer_survives() {
        let writer = writer();

        let result: Result<()> = writer.submit(|_| panic!("boom")).await;
        match result {
            Err(MirrorError::TaskError(message)) => assert!(message.contains("boom")),
            other => panic!("unexpected result: {:?}", other),
        }

        let count: i64 = writer
            .submit(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_failed_transaction_rolls_back() {
        let writer = writer();

        let result: Result<()> = writer
            .submit(|conn| {
                let tx = conn.transaction()?;
                tx.execute("INSERT INTO t (v) VALUES (1)", [])?;
                Err(MirrorError::ValidationError("abandon".into()))
            })
            .await;
        assert!(result.is_err());

        let count: i64 = writer
            .submit(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
