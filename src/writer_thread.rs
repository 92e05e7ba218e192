use flume::{Receiver, Sender};
use std::path::PathBuf;
use std::thread;
use tracing::{debug, info, warn};

use crate::config::Limits;
use crate::models::{MediaAsset, ThreadRecord};
use crate::state::{CrawlState, StateError};
use crate::writer::{IndexEntry, MirrorWriter, PersistenceError, RebuildReport, UrlRewriteMap};

/// Work for the writer thread. Every job carries its own reply channel.
pub enum WriterJob {
    /// Export one assembled thread. `media` holds the assets resolved for its posts.
    Thread {
        record: Box<ThreadRecord>,
        media: Vec<(String, MediaAsset)>,
        reply: Sender<Result<IndexEntry, PersistenceError>>,
    },
    /// Make previously written threads resolvable as link targets.
    Register { entries: Vec<IndexEntry> },
    Index {
        entries: Vec<IndexEntry>,
        reply: Sender<Result<PathBuf, PersistenceError>>,
    },
    Rebuild {
        reply: Sender<Result<RebuildReport, PersistenceError>>,
    },
    Checkpoint {
        state: Box<CrawlState>,
        reply: Sender<Result<PathBuf, StateError>>,
    },
}

/// Handle for the writer thread. All disk output of a crawl goes through it.
pub struct WriterThread {
    handle: Option<thread::JoinHandle<()>>,
    job_tx: Option<Sender<WriterJob>>,
}

impl WriterThread {
    /// Spawns a writer thread.
    pub fn spawn(writer: MirrorWriter) -> Self {
        let (job_tx, job_rx) = flume::bounded::<WriterJob>(Limits::WRITER_QUEUE_CAPACITY);

        let handle = thread::Builder::new()
            .name("mirror-writer".to_string())
            .spawn(move || Self::writer_loop(writer, job_rx))
            .map_err(|e| warn!("Could not start writer thread: {}", e))
            .ok();

        Self {
            handle,
            job_tx: Some(job_tx),
        }
    }

    async fn submit<T>(
        &self,
        make_job: impl FnOnce(Sender<T>) -> WriterJob,
    ) -> Option<T> {
        let tx = self.job_tx.as_ref()?;
        let (reply_tx, reply_rx) = flume::bounded(1);
        tx.send_async(make_job(reply_tx)).await.ok()?;
        reply_rx.recv_async().await.ok()
    }

    pub async fn write_thread(
        &self,
        record: ThreadRecord,
        media: Vec<(String, MediaAsset)>,
    ) -> Result<IndexEntry, PersistenceError> {
        self.submit(|reply| WriterJob::Thread {
            record: Box::new(record),
            media,
            reply,
        })
        .await
        .unwrap_or(Err(PersistenceError::WriterClosed))
    }

    pub async fn register(&self, entries: Vec<IndexEntry>) -> Result<(), PersistenceError> {
        let tx = self.job_tx.as_ref().ok_or(PersistenceError::WriterClosed)?;
        tx.send_async(WriterJob::Register { entries })
            .await
            .map_err(|_| PersistenceError::WriterClosed)
    }

    pub async fn write_index(&self, entries: Vec<IndexEntry>) -> Result<PathBuf, PersistenceError> {
        self.submit(|reply| WriterJob::Index { entries, reply })
            .await
            .unwrap_or(Err(PersistenceError::WriterClosed))
    }

    pub async fn rebuild(&self) -> Result<RebuildReport, PersistenceError> {
        self.submit(|reply| WriterJob::Rebuild { reply })
            .await
            .unwrap_or(Err(PersistenceError::WriterClosed))
    }

    /// Save a checkpoint. `None` means the writer thread is gone.
    pub async fn checkpoint(&self, state: CrawlState) -> Option<Result<PathBuf, StateError>> {
        self.submit(|reply| WriterJob::Checkpoint {
            state: Box::new(state),
            reply,
        })
        .await
    }

    /// Close the queue and wait for outstanding jobs to finish.
    pub fn shutdown(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.job_tx.take();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("Writer thread panicked");
        }
    }

    /// The main loop for the writer thread. Runs until every sender is dropped.
    fn writer_loop(writer: MirrorWriter, job_rx: Receiver<WriterJob>) {
        let mut links = UrlRewriteMap::new();
        let mut written = 0usize;

        while let Ok(job) = job_rx.recv() {
            match job {
                WriterJob::Thread {
                    record,
                    media,
                    reply,
                } => {
                    links.clear_media();
                    for (url, asset) in media {
                        links.insert_media(url, asset);
                    }
                    links.register_thread(&record);
                    let result = writer.write_thread(&record, &links);
                    if result.is_ok() {
                        written += 1;
                    }
                    let _ = reply.send(result);
                }
                WriterJob::Register { entries } => {
                    for entry in &entries {
                        for url in &entry.source_urls {
                            links.insert_thread(url.as_str(), PathBuf::from(&entry.html_path));
                        }
                    }
                    debug!("Registered {} archived threads", entries.len());
                }
                WriterJob::Index { entries, reply } => {
                    let _ = reply.send(writer.write_index(&entries));
                }
                WriterJob::Rebuild { reply } => {
                    let _ = reply.send(writer.rebuild());
                }
                WriterJob::Checkpoint { state, reply } => {
                    let _ = reply.send(state.save(writer.out_dir()));
                }
            }
        }

        links.clear_media();
        info!(
            "Writer thread exiting: {} threads written, {} thread links known",
            written,
            links.thread_len()
        );
    }
}

impl Drop for WriterThread {
    fn drop(&mut self) {
        self.join();
    }
}
