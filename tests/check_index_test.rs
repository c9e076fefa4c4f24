use std::fs;
use std::sync::Arc;

use tempfile::TempDir;

use segdex::document::{Document, Term};
use segdex::error::{Result, SegdexError};
use segdex::index::check::CheckIndex;
use segdex::index::config::IndexWriterConfig;
use segdex::index::manifest::SegmentInfos;
use segdex::index::merge_policy::NoMergePolicy;
use segdex::index::merge_scheduler::MergeSchedulerConfig;
use segdex::index::reader::{DirectoryReader, IndexReader};
use segdex::index::writer::IndexWriter;
use segdex::storage::Storage;
use segdex::storage::file::FileStorage;

fn open_storage(dir: &TempDir) -> Result<Arc<FileStorage>> {
    Ok(Arc::new(FileStorage::open(dir.path())?))
}

fn config() -> IndexWriterConfig {
    IndexWriterConfig::new()
        .with_max_buffered_docs(Some(2))
        .with_merge_policy(Arc::new(NoMergePolicy))
        .with_merge_scheduler(MergeSchedulerConfig::Serial)
}

/// Nineteen single-term docs in ten segments, with `aaa5` deleted.
fn build_index(storage: Arc<FileStorage>) -> Result<()> {
    let writer = IndexWriter::new(storage, config())?;
    for i in 0..19 {
        let doc = Document::builder().add_keyword("field", format!("aaa{i}")).build();
        writer.add_document(doc)?;
    }
    writer.delete_documents(Term::new("field", "aaa5"))?;
    writer.commit()?;
    writer.close()
}

#[test]
fn test_check_clean_index_on_disk() -> Result<()> {
    let dir = TempDir::new()?;
    let storage = open_storage(&dir)?;
    build_index(storage.clone())?;

    let status = CheckIndex::new(storage).check_index()?;
    assert!(status.clean);
    assert!(!status.partial);
    assert_eq!(status.segments_file_name.as_deref(), Some("segments_1"));
    assert_eq!(status.num_segments, 10);
    assert_eq!(status.term_count, 18);
    assert_eq!(status.stored_doc_count, 18);
    assert_eq!(status.total_docs, 18);

    let with_deletes: Vec<&str> = status
        .segments
        .iter()
        .filter(|s| s.del_count > 0)
        .map(|s| s.name.as_str())
        .collect();
    assert_eq!(with_deletes, vec!["_2"]);
    Ok(())
}

#[test]
fn test_check_selected_segments() -> Result<()> {
    let dir = TempDir::new()?;
    let storage = open_storage(&dir)?;
    build_index(storage.clone())?;

    let checker = CheckIndex::new(storage).with_segments(["_0", "_9"]);
    let status = checker.check_index()?;
    assert!(status.partial);
    assert_eq!(status.segments.len(), 2);
    assert_eq!(status.num_segments, 10);
    assert_eq!(status.stored_doc_count, 3);

    // Partial results never drive a fix.
    assert!(matches!(
        checker.fix_index(&status),
        Err(SegdexError::IllegalState(_))
    ));
    Ok(())
}

#[test]
fn test_fix_index_after_lost_file() -> Result<()> {
    let dir = TempDir::new()?;
    let storage = open_storage(&dir)?;
    build_index(storage.clone())?;

    let infos = SegmentInfos::read_latest(storage.as_ref())?;
    let victim = infos.segments()[3]
        .info
        .files
        .iter()
        .find(|f| f.ends_with(".tim"))
        .cloned()
        .expect("segment has a terms file");
    fs::remove_file(dir.path().join(&victim))?;

    let checker = CheckIndex::new(storage.clone());
    let status = checker.check_index()?;
    assert!(!status.clean);
    assert_eq!(status.broken_segments, vec!["_3".to_string()]);
    assert_eq!(status.lost_docs, 2);

    // A writer holds the lock, so the fix is refused.
    let writer = IndexWriter::new(storage.clone(), config())?;
    assert!(matches!(
        checker.fix_index(&status),
        Err(SegdexError::LockObtainFailed(_))
    ));
    writer.close()?;

    let generation = checker.fix_index(&status)?;
    assert_eq!(generation, 2);
    let status = checker.check_index()?;
    assert!(status.clean);
    assert_eq!(status.num_segments, 9);
    assert_eq!(status.total_docs, 16);

    let reader = DirectoryReader::open(storage)?;
    assert_eq!(reader.num_docs(), 16);
    assert!(reader.search(&Term::new("field", "aaa6"))?.is_empty());
    assert_eq!(reader.search(&Term::new("field", "aaa8"))?.len(), 1);
    reader.close()?;
    Ok(())
}

#[test]
fn test_fix_refuses_stale_status() -> Result<()> {
    let dir = TempDir::new()?;
    let storage = open_storage(&dir)?;
    build_index(storage.clone())?;
    let checker = CheckIndex::new(storage.clone());
    let status = checker.check_index()?;

    let writer = IndexWriter::new(storage.clone(), config())?;
    writer.add_document(Document::builder().add_keyword("field", "late").build())?;
    writer.commit()?;
    writer.close()?;

    assert!(matches!(
        checker.fix_index(&status),
        Err(SegdexError::IllegalState(_))
    ));
    // Nothing broken means nothing to write.
    let fresh = checker.check_index()?;
    assert_eq!(checker.fix_index(&fresh)?, fresh.generation);
    Ok(())
}
