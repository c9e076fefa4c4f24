//! Criterion benchmarks for the segdex write path.
//!
//! Everything runs on [`MemoryStorage`] so the numbers measure indexing,
//! commit and merge work rather than the disk.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BatchSize, Criterion, Throughput, criterion_group, criterion_main};
use segdex::document::{Document, Term};
use segdex::index::check::CheckIndex;
use segdex::index::config::IndexWriterConfig;
use segdex::index::merge_policy::{NoMergePolicy, TieredMergePolicy};
use segdex::index::merge_scheduler::MergeSchedulerConfig;
use segdex::index::writer::IndexWriter;
use segdex::storage::memory::MemoryStorage;

/// Generate test documents for benchmarking.
fn generate_documents(count: usize) -> Vec<Document> {
    let words = [
        "segment", "merge", "commit", "generation", "manifest", "deletion", "policy", "snapshot",
        "reader", "writer", "flush", "buffer",
    ];
    (0..count)
        .map(|i| {
            let body: Vec<&str> = (0..12).map(|j| words[(i * 7 + j * 3) % words.len()]).collect();
            Document::builder()
                .add_keyword("id", i.to_string())
                .add_text("body", body.join(" "))
                .add_numeric("rank", i as i64)
                .build()
        })
        .collect()
}

fn serial_config(max_buffered_docs: usize) -> IndexWriterConfig {
    IndexWriterConfig::new()
        .with_max_buffered_docs(Some(max_buffered_docs))
        .with_merge_policy(Arc::new(NoMergePolicy))
        .with_merge_scheduler(MergeSchedulerConfig::Serial)
}

/// Write `docs` into a fresh in-memory index and commit.
fn build_index(docs: &[Document], config: IndexWriterConfig) -> (Arc<MemoryStorage>, IndexWriter) {
    let storage = Arc::new(MemoryStorage::new_default());
    let writer = IndexWriter::new(storage.clone(), config).unwrap();
    for doc in docs {
        writer.add_document(doc.clone()).unwrap();
    }
    writer.commit().unwrap();
    (storage, writer)
}

fn bench_indexing(c: &mut Criterion) {
    let mut group = c.benchmark_group("indexing");
    let docs = generate_documents(1000);

    group.throughput(Throughput::Elements(docs.len() as u64));
    group.bench_function("add_and_commit_1000", |b| {
        b.iter(|| {
            let (_storage, writer) = build_index(black_box(&docs), serial_config(100));
            writer.close().unwrap();
        })
    });

    group.bench_function("add_with_tiered_merges_1000", |b| {
        let config = || {
            IndexWriterConfig::new()
                .with_max_buffered_docs(Some(50))
                .with_merge_policy(Arc::new(TieredMergePolicy::new()))
                .with_merge_scheduler(MergeSchedulerConfig::Serial)
        };
        b.iter(|| {
            let (_storage, writer) = build_index(black_box(&docs), config());
            writer.close().unwrap();
        })
    });

    group.finish();
}

fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit");
    let docs = generate_documents(200);

    // Cost of a commit that only carries deletes.
    group.bench_function("deletes_only_commit", |b| {
        b.iter_batched(
            || build_index(&docs, serial_config(20)),
            |(_storage, writer)| {
                for i in (0..200).step_by(10) {
                    writer.delete_documents(Term::new("id", i.to_string())).unwrap();
                }
                writer.commit().unwrap();
                writer.close().unwrap();
            },
            BatchSize::SmallInput,
        )
    });

    group.bench_function("prepare_then_rollback", |b| {
        b.iter_batched(
            || build_index(&docs, serial_config(20)),
            |(_storage, writer)| {
                writer.add_document(docs[0].clone()).unwrap();
                writer.prepare_commit().unwrap();
                writer.rollback().unwrap();
                writer.close().unwrap();
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn bench_merging(c: &mut Criterion) {
    let mut group = c.benchmark_group("merging");
    group.sample_size(20);
    let docs = generate_documents(2000);

    group.throughput(Throughput::Elements(docs.len() as u64));
    group.bench_function("force_merge_20_segments", |b| {
        b.iter_batched(
            || build_index(&docs, serial_config(100)),
            |(_storage, writer)| {
                writer.force_merge(1, true).unwrap();
                writer.commit().unwrap();
                writer.close().unwrap();
            },
            BatchSize::LargeInput,
        )
    });

    group.bench_function("force_merge_deletes", |b| {
        b.iter_batched(
            || {
                let (storage, writer) = build_index(&docs, serial_config(100));
                for i in (0..2000).step_by(4) {
                    writer.delete_documents(Term::new("id", i.to_string())).unwrap();
                }
                writer.commit().unwrap();
                (storage, writer)
            },
            |(_storage, writer)| {
                writer.force_merge_deletes(true).unwrap();
                writer.close().unwrap();
            },
            BatchSize::LargeInput,
        )
    });

    group.finish();
}

fn bench_check_index(c: &mut Criterion) {
    let mut group = c.benchmark_group("check_index");
    let docs = generate_documents(2000);
    let (storage, writer) = build_index(&docs, serial_config(100));
    writer.close().unwrap();

    group.throughput(Throughput::Elements(docs.len() as u64));
    group.bench_function("check_20_segments", |b| {
        b.iter(|| {
            let status = CheckIndex::new(storage.clone()).check_index().unwrap();
            black_box(status)
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_indexing,
    bench_commit,
    bench_merging,
    bench_check_index
);
criterion_main!(benches);
