use std::sync::Arc;

use segdex::document::{Document, Term};
use segdex::error::Result;
use segdex::index::check::CheckIndex;
use segdex::index::config::IndexWriterConfig;
use segdex::index::manifest::SegmentInfos;
use segdex::index::merge_policy::NoMergePolicy;
use segdex::index::merge_scheduler::MergeSchedulerConfig;
use segdex::index::reader::{DirectoryReader, IndexReader};
use segdex::index::writer::IndexWriter;
use segdex::storage::Storage;
use segdex::storage::memory::{FailPoint, MemoryStorage, MemoryStorageConfig, StorageOp};

fn doc(id: usize) -> Document {
    Document::builder()
        .add_keyword("id", id.to_string())
        .add_text("body", format!("crash test body {id}"))
        .build()
}

fn config() -> IndexWriterConfig {
    IndexWriterConfig::new()
        .with_max_buffered_docs(Some(2))
        .with_merge_policy(Arc::new(NoMergePolicy))
        .with_merge_scheduler(MergeSchedulerConfig::Serial)
}

fn memory_storage() -> Arc<MemoryStorage> {
    Arc::new(MemoryStorage::new(MemoryStorageConfig::default()))
}

fn committed_docs(storage: &Arc<MemoryStorage>) -> Result<u64> {
    let reader = DirectoryReader::open(storage.clone())?;
    let docs = reader.num_docs();
    reader.close()?;
    Ok(docs)
}

#[test]
fn test_crash_before_commit_keeps_last_commit() -> Result<()> {
    let storage = memory_storage();
    let writer = IndexWriter::new(storage.clone(), config())?;
    for i in 0..5 {
        writer.add_document(doc(i))?;
    }
    writer.commit()?;
    for i in 5..11 {
        writer.add_document(doc(i))?;
    }
    writer.delete_documents(Term::new("id", "0"))?;

    storage.crash();
    // The process died: nothing of the old writer runs again.
    std::mem::forget(writer);

    assert_eq!(committed_docs(&storage)?, 5);
    let writer = IndexWriter::new(storage.clone(), config())?;
    assert_eq!(writer.num_docs(), 5);
    writer.close()?;
    assert!(CheckIndex::new(storage).check_index()?.clean);
    Ok(())
}

#[test]
fn test_crash_after_prepare_is_ignored() -> Result<()> {
    let storage = memory_storage();
    let writer = IndexWriter::new(storage.clone(), config())?;
    writer.add_document(doc(0))?;
    writer.commit()?;
    for i in 1..4 {
        writer.add_document(doc(i))?;
    }
    writer.prepare_commit()?;

    // The prepared manifest is durable but was never published.
    storage.crash();
    std::mem::forget(writer);
    assert!(storage.file_exists("pending_segments_2"));
    assert_eq!(committed_docs(&storage)?, 1);

    let writer = IndexWriter::new(storage.clone(), config())?;
    assert!(!storage.file_exists("pending_segments_2"));
    let referenced = writer.segment_infos().files(false);
    for file in storage.list_files()? {
        if file.starts_with('_') {
            assert!(referenced.contains(&file), "leftover {file}");
        }
    }

    // Generation 2 was attempted and is never reused.
    writer.add_document(doc(10))?;
    writer.commit()?;
    assert_eq!(SegmentInfos::read_latest(storage.as_ref())?.generation, 3);
    writer.close()?;
    Ok(())
}

#[test]
fn test_crash_after_commit_keeps_everything() -> Result<()> {
    let storage = memory_storage();
    let writer = IndexWriter::new(storage.clone(), config())?;
    for i in 0..9 {
        writer.add_document(doc(i))?;
    }
    writer.delete_documents(Term::new("id", "4"))?;
    writer.commit()?;
    assert!(
        storage
            .unsynced_files()
            .iter()
            .all(|f| !f.starts_with('_') && !f.starts_with("segments_")),
        "committed files must be synced: {:?}",
        storage.unsynced_files()
    );

    storage.crash();
    std::mem::forget(writer);
    assert_eq!(committed_docs(&storage)?, 8);
    assert!(CheckIndex::new(storage).check_index()?.clean);
    Ok(())
}

#[test]
fn test_failed_publish_burns_generation() -> Result<()> {
    let storage = memory_storage();
    let writer = IndexWriter::new(storage.clone(), config())?;
    writer.add_document(doc(0))?;
    writer.commit()?;

    writer.add_document(doc(1))?;
    storage.fail_on(FailPoint::once(StorageOp::Rename, "pending_segments"));
    assert!(writer.commit().is_err());
    assert!(!storage.file_exists("pending_segments_2"));
    assert!(!storage.file_exists("segments_2"));
    assert_eq!(committed_docs(&storage)?, 1);

    writer.commit()?;
    assert_eq!(SegmentInfos::read_latest(storage.as_ref())?.generation, 3);
    assert_eq!(committed_docs(&storage)?, 2);
    writer.close()?;
    Ok(())
}

#[test]
fn test_failed_sync_leaves_writer_usable() -> Result<()> {
    let storage = memory_storage();
    let writer = IndexWriter::new(storage.clone(), config())?;
    for i in 0..3 {
        writer.add_document(doc(i))?;
    }
    storage.fail_on(FailPoint::once(StorageOp::Sync, "_"));
    assert!(writer.commit().is_err());
    assert!(DirectoryReader::open(storage.clone()).is_err());

    writer.commit()?;
    assert_eq!(committed_docs(&storage)?, 3);
    writer.close()?;
    Ok(())
}

#[test]
fn test_disk_full_during_flush() -> Result<()> {
    let storage = memory_storage();
    let writer = IndexWriter::new(storage.clone(), config())?;
    for i in 0..4 {
        writer.add_document(doc(i))?;
    }
    writer.commit()?;

    storage.set_max_size(Some(storage.total_size()));
    writer.add_document(doc(4))?;
    assert!(writer.add_document(doc(5)).is_err(), "flush must hit the size cap");
    let leftovers: Vec<String> = storage
        .list_files()?
        .into_iter()
        .filter(|f| f.starts_with("_2"))
        .collect();
    assert!(leftovers.is_empty(), "partial segment files: {leftovers:?}");

    // Buffered documents were kept and flush once there is room.
    storage.set_max_size(None);
    assert_eq!(writer.num_docs(), 6);
    writer.commit()?;
    assert_eq!(committed_docs(&storage)?, 6);
    writer.close()?;
    Ok(())
}

#[test]
fn test_random_failures_never_corrupt() -> Result<()> {
    let storage = memory_storage();
    let writer = IndexWriter::new(storage.clone(), config())?;
    writer.commit()?;
    let mut expected = 0;

    storage.set_random_failure_rate(0.05);
    for i in 0..300 {
        let _ = match i % 7 {
            3 => writer.delete_documents(Term::new("id", (i / 2).to_string())),
            _ => writer.add_document(doc(i)),
        };
        if i % 10 == 9 && writer.commit().is_ok() {
            expected = writer.num_docs();
        }
    }
    storage.clear_failures();
    assert!(storage.injected_failures() > 0);

    writer.rollback()?;
    writer.close()?;

    assert_eq!(committed_docs(&storage)?, expected);
    let status = CheckIndex::new(storage.clone()).check_index()?;
    assert!(status.clean, "broken segments: {:?}", status.broken_segments);

    let writer = IndexWriter::new(storage.clone(), config())?;
    assert_eq!(writer.num_docs(), expected);
    writer.close()?;
    Ok(())
}
