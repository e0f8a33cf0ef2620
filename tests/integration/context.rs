//! Context assembly, caching, and size validation

use crate::integration::support::{assembler, project_store, PROJECT};
use scribe::context::{
    AssembleOptions, ContextAssembler, ContextCache, DocumentStore, FsDocumentStore,
    MemoryDocumentStore, ProjectMetadata, SourceDocument,
};
use scribe::tokens::TokenEstimator;
use scribe::types::ProjectId;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn context_is_cached_until_invalidated() {
    let store = project_store();
    let assembler = assembler(Arc::clone(&store));
    let project = ProjectId::new(PROJECT);

    let first = assembler.assemble(&project, AssembleOptions::default()).await.unwrap();
    let second = assembler.assemble(&project, AssembleOptions::default()).await.unwrap();
    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(store.fetch_count(), 1);
    assert!(Arc::ptr_eq(&first.capability_text, &second.capability_text));

    store
        .add_capability_doc(&project, SourceDocument::new("Safety record", "Zero incidents."))
        .unwrap();
    assembler.invalidate(Some(&project));

    let third = assembler.assemble(&project, AssembleOptions::default()).await.unwrap();
    assert!(!third.from_cache);
    assert!(third.capability_text.contains("Zero incidents."));
    assert!(third.token_estimate > first.token_estimate);
    assert_eq!(store.fetch_count(), 2);
}

#[tokio::test]
async fn skip_cache_forces_a_rebuild() {
    let store = project_store();
    let assembler = assembler(Arc::clone(&store));
    let project = ProjectId::new(PROJECT);

    assembler.assemble(&project, AssembleOptions::default()).await.unwrap();
    let fresh = assembler
        .assemble(&project, AssembleOptions { skip_cache: true })
        .await
        .unwrap();
    assert!(!fresh.from_cache);
    assert_eq!(store.fetch_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn cached_context_expires_after_ttl() {
    let store = project_store();
    let assembler = ContextAssembler::new(
        Arc::clone(&store) as Arc<dyn DocumentStore>,
        Arc::new(ContextCache::new(Duration::from_secs(30))),
    )
    .with_estimator(TokenEstimator::heuristic());
    let project = ProjectId::new(PROJECT);

    assembler.assemble(&project, AssembleOptions::default()).await.unwrap();
    tokio::time::advance(Duration::from_secs(31)).await;
    let later = assembler.assemble(&project, AssembleOptions::default()).await.unwrap();

    assert!(!later.from_cache);
    assert_eq!(store.fetch_count(), 2);
}

#[tokio::test]
async fn seventy_thousand_token_context_is_invalid() {
    let store = Arc::new(MemoryDocumentStore::new());
    store.insert_project(
        ProjectId::new("big"),
        ProjectMetadata::new("Big"),
        vec![SourceDocument::new("Archive", "x".repeat(280_000))],
        Vec::new(),
    );
    let assembler = assembler(store);

    let context = assembler
        .assemble(&ProjectId::new("big"), AssembleOptions::default())
        .await
        .unwrap();
    let validation = assembler.validate(&context);

    assert!(!validation.valid);
    assert!(validation.token_estimate >= 70_000);
    assert!(validation.warning.unwrap().contains("64,000"));
}

#[tokio::test]
async fn near_limit_context_is_valid_with_warning() {
    let store = Arc::new(MemoryDocumentStore::new());
    store.insert_project(
        ProjectId::new("medium"),
        ProjectMetadata::new("Medium"),
        vec![SourceDocument::new("Archive", "x".repeat(220_000))],
        Vec::new(),
    );
    let assembler = assembler(store);

    let context = assembler
        .assemble(&ProjectId::new("medium"), AssembleOptions::default())
        .await
        .unwrap();
    let validation = assembler.validate(&context);

    assert!(validation.valid);
    assert!(validation.warning.is_some());
}

#[tokio::test]
async fn filesystem_store_feeds_the_assembler() {
    let root = TempDir::new().unwrap();
    let project_dir = root.path().join("harbor");
    std::fs::create_dir_all(&project_dir).unwrap();
    std::fs::write(project_dir.join("rfp.txt"), "Deliver a phased schedule.").unwrap();
    std::fs::write(
        project_dir.join("project.json"),
        r#"{
  "project": { "name": "Harbor", "client": "Port Authority" },
  "capabilities": [
    { "name": "Profile", "category": "profile", "is_primary": true, "text": "Bridge specialists." },
    { "name": "Scanned brochure" }
  ],
  "requirements": [
    { "name": "RFP", "text_path": "rfp.txt" }
  ]
}"#,
    )
    .unwrap();

    let assembler = ContextAssembler::new(
        Arc::new(FsDocumentStore::new(root.path())),
        Arc::new(ContextCache::default()),
    )
    .with_estimator(TokenEstimator::heuristic());

    let context = assembler
        .assemble(&ProjectId::new("harbor"), AssembleOptions::default())
        .await
        .unwrap();

    assert_eq!(context.metadata.client.as_deref(), Some("Port Authority"));
    assert!(context
        .capability_text
        .contains("=== Profile [profile] (primary) ==="));
    assert!(!context.capability_text.contains("Scanned brochure"));
    assert!(context.requirement_text.contains("Deliver a phased schedule."));
    assert!(context.render().contains("Client: Port Authority"));
}
