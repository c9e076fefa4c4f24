use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use segdex::document::{Document, Term};
use segdex::error::Result;
use segdex::index::check::CheckIndex;
use segdex::index::config::IndexWriterConfig;
use segdex::index::merge_policy::TieredMergePolicy;
use segdex::index::merge_scheduler::{ConcurrentMergeSchedulerConfig, MergeSchedulerConfig};
use segdex::index::reader::{DirectoryReader, IndexReader};
use segdex::index::writer::IndexWriter;
use segdex::storage::memory::{MemoryStorage, MemoryStorageConfig};

const THREADS: usize = 4;
const DOCS_PER_THREAD: usize = 150;

fn doc(thread: usize, id: usize) -> Document {
    Document::builder()
        .add_keyword("id", format!("{thread}-{id}"))
        .add_keyword("thread", thread.to_string())
        .add_numeric("seq", id as i64)
        .build()
}

fn config() -> IndexWriterConfig {
    let policy = TieredMergePolicy::new()
        .with_segs_per_tier(3.0)
        .with_max_merge_at_once(3);
    IndexWriterConfig::new()
        .with_max_buffered_docs(Some(7))
        .with_merge_policy(Arc::new(policy))
        .with_merge_scheduler(MergeSchedulerConfig::Concurrent(
            ConcurrentMergeSchedulerConfig::default().with_thread_counts(1, 3),
        ))
}

#[test]
fn test_concurrent_indexing_with_merges() -> Result<()> {
    let storage = Arc::new(MemoryStorage::new(MemoryStorageConfig::default()));
    let writer = IndexWriter::new(storage.clone(), config())?;
    let done = AtomicBool::new(false);

    thread::scope(|scope| -> Result<()> {
        let indexers: Vec<_> = (0..THREADS)
            .map(|t| {
                let writer = &writer;
                scope.spawn(move || -> Result<()> {
                    for i in 0..DOCS_PER_THREAD {
                        writer.add_document(doc(t, i))?;
                        // Every tenth doc is deleted again.
                        if i % 10 == 9 {
                            writer.delete_documents(Term::new("id", format!("{t}-{i}")))?;
                        }
                    }
                    Ok(())
                })
            })
            .collect();

        let committer = scope.spawn(|| -> Result<u32> {
            let mut commits = 0;
            while !done.load(Ordering::SeqCst) {
                writer.commit()?;
                commits += 1;
                thread::yield_now();
            }
            Ok(commits)
        });

        let refresher = scope.spawn(|| -> Result<()> {
            let total = (THREADS * DOCS_PER_THREAD) as u64;
            while !done.load(Ordering::SeqCst) {
                let reader = writer.get_reader(true)?;
                assert!(reader.num_docs() <= reader.max_doc());
                assert!(reader.max_doc() <= total);
                reader.close()?;
            }
            Ok(())
        });

        for indexer in indexers {
            indexer.join().expect("indexer panicked")?;
        }
        done.store(true, Ordering::SeqCst);
        committer.join().expect("committer panicked")?;
        refresher.join().expect("refresher panicked")?;
        Ok(())
    })?;

    let expected = (THREADS * DOCS_PER_THREAD * 9 / 10) as u64;
    writer.wait_for_merges()?;
    writer.commit()?;
    assert_eq!(writer.num_docs(), expected);
    assert!(writer.segment_count() < (THREADS * DOCS_PER_THREAD) / 7);

    let reader = writer.get_reader(true)?;
    for t in 0..THREADS {
        assert_eq!(
            reader.search(&Term::new("thread", t.to_string()))?.len(),
            DOCS_PER_THREAD * 9 / 10
        );
        assert!(reader.search(&Term::new("id", format!("{t}-9")))?.is_empty());
        assert_eq!(reader.search(&Term::new("id", format!("{t}-8")))?.len(), 1);
    }
    reader.close()?;
    writer.close()?;

    let reader = DirectoryReader::open(storage.clone())?;
    assert_eq!(reader.num_docs(), expected);
    reader.close()?;
    let status = CheckIndex::new(storage).check_index()?;
    assert!(status.clean, "broken segments: {:?}", status.broken_segments);
    assert_eq!(status.total_docs, expected);
    Ok(())
}

#[test]
fn test_updates_from_many_threads() -> Result<()> {
    let storage = Arc::new(MemoryStorage::new(MemoryStorageConfig::default()));
    let writer = IndexWriter::new(storage.clone(), config())?;
    for i in 0..40 {
        writer.add_document(doc(0, i))?;
    }
    writer.commit()?;

    // Each thread rewrites its own slice of ids many times.
    thread::scope(|scope| -> Result<()> {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let writer = &writer;
                scope.spawn(move || -> Result<()> {
                    for round in 0..5 {
                        for i in (t..40).step_by(THREADS) {
                            let mut replacement = doc(0, i);
                            replacement.set_numeric("seq", (round * 100 + i) as i64);
                            writer.update_document(Term::new("id", format!("0-{i}")), replacement)?;
                        }
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("updater panicked")?;
        }
        Ok(())
    })?;

    writer.wait_for_merges()?;
    writer.commit()?;
    writer.close()?;

    let reader = DirectoryReader::open(storage)?;
    assert_eq!(reader.num_docs(), 40);
    for i in 0..40 {
        let hits = reader.search(&Term::new("id", format!("0-{i}")))?;
        assert_eq!(hits.len(), 1, "id 0-{i}");
        assert_eq!(reader.numeric_doc_value(hits[0], "seq")?, Some((400 + i) as i64));
    }
    reader.close()?;
    Ok(())
}
