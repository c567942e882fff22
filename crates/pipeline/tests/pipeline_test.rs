//! End-to-end tests for indexing and querying

mod common;

use common::*;
use graphrag_core::{BucketParams, CacheKey, Chunker, CommunityId, Document, EntityKey, Query, Stage};
use graphrag_db::GraphStore;
use graphrag_pipeline::{
    CompletionClient, CompletionError, CompletionRequest, ElementExtractor, ExtractionPayload, Pipeline,
    PipelineError, RequestKind, NO_INFORMATION_ANSWER,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Index the supply-chain document and answer a question whose answer
/// only exists in the relationships
#[tokio::test]
async fn test_supply_chain_index_and_query() {
    let repo = create_test_repo().await;
    let client = Arc::new(corpus_client());
    let pipeline = Pipeline::new(test_config(), repo, client.clone());

    let doc = Document::new(SUPPLY_CHAIN_TEXT);
    let report = pipeline.index(doc.clone(), deadline()).await.unwrap();

    assert_eq!(report.document_ids, vec![doc.id.clone()]);
    assert_eq!(report.chunks_total, 1);
    assert_eq!(report.chunks_extracted, 1);
    assert_eq!(report.node_count, 3);
    assert_eq!(report.edge_count, 2);
    assert!(report.failures.is_empty());

    let hierarchy = pipeline.load_communities(&report.graph_id).await.unwrap();
    let level0 = hierarchy.level(0);
    assert_eq!(level0.len(), 1);
    assert_eq!(level0[0].size(), 3);
    assert!(level0[0].members.contains(&EntityKey::new("JapanCo", "organization")));

    let graph = pipeline.load_graph(&report.graph_id).await.unwrap();
    assert!(graph
        .edge(
            &EntityKey::new("Acme Corp", "organization"),
            &EntityKey::new("TaiwanTech", "organization"),
        )
        .is_some());

    let answer = pipeline
        .query(&report.graph_id, &Query::new(SUPPLY_QUESTION), deadline())
        .await
        .unwrap();
    assert!(answer.text.starts_with("Yes"));
    assert!(answer.cites(CommunityId::new(0, 0)));
    assert_eq!(client.calls(RequestKind::Map), 1);
    assert_eq!(client.calls(RequestKind::Reduce), 1);
}

/// Re-indexing unchanged documents makes no completion calls
#[tokio::test]
async fn test_reindex_is_free() {
    let store = memory_store();
    let client = Arc::new(corpus_client());
    let pipeline = Pipeline::new(test_config(), store, client.clone());
    let docs = vec![Document::new(SUPPLY_CHAIN_TEXT), Document::new(ENGINE_TEXT)];

    let first = pipeline.index_corpus(docs.clone(), deadline()).await.unwrap();
    let extracts = client.calls(RequestKind::Extract);
    let summaries = client.calls(RequestKind::Summarize);
    assert_eq!(extracts, 2);
    assert_eq!(summaries, first.summaries);

    let second = pipeline.index_corpus(docs.into_iter().rev().collect(), deadline()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(client.calls(RequestKind::Extract), extracts);
    assert_eq!(client.calls(RequestKind::Summarize), summaries);
}

/// Two disconnected topics give two level-0 communities
#[tokio::test]
async fn test_corpus_communities_follow_topics() {
    let store = memory_store();
    let client = Arc::new(corpus_client());
    let pipeline = Pipeline::new(test_config(), store, client);

    let report = pipeline
        .index_corpus(vec![Document::new(SUPPLY_CHAIN_TEXT), Document::new(ENGINE_TEXT)], deadline())
        .await
        .unwrap();
    assert_eq!(report.node_count, 6);
    assert_eq!(report.edge_count, 4);

    let hierarchy = pipeline.load_communities(&report.graph_id).await.unwrap();
    let level0 = hierarchy.level(0);
    assert_eq!(level0.len(), 2);
    assert!(level0[0].members.contains(&EntityKey::new("Acme Corp", "organization")));
    assert!(level0[1].members.contains(&EntityKey::new("Ada Lovelace", "person")));
}

/// A document-scoped query only asks communities built from that document
#[tokio::test]
async fn test_query_scoped_to_documents() {
    let store = memory_store();
    let client = Arc::new(corpus_client());
    let pipeline = Pipeline::new(test_config(), store, client.clone());
    let engine = Document::new(ENGINE_TEXT);

    let report = pipeline
        .index_corpus(vec![Document::new(SUPPLY_CHAIN_TEXT), engine.clone()], deadline())
        .await
        .unwrap();

    let query = Query::new(ENGINE_QUESTION).for_documents(vec![engine.id.clone()]);
    let answer = pipeline.query(&report.graph_id, &query, deadline()).await.unwrap();
    assert_eq!(client.calls(RequestKind::Map), 1);
    assert_eq!(answer.communities, vec![CommunityId::new(0, 1)]);
}

/// No relevant community means a fixed answer and no reduce call
#[tokio::test]
async fn test_query_without_relevant_communities() {
    let store = memory_store();
    let client = Arc::new(corpus_client());
    let pipeline = Pipeline::new(test_config(), store, client.clone());

    let report = pipeline.index(Document::new(SUPPLY_CHAIN_TEXT), deadline()).await.unwrap();
    let answer = pipeline
        .query(&report.graph_id, &Query::new("What is the capital of Peru?"), deadline())
        .await
        .unwrap();

    assert_eq!(answer.text, NO_INFORMATION_ANSWER);
    assert!(answer.communities.is_empty());
    assert_eq!(client.calls(RequestKind::Reduce), 0);
}

/// Recomputing an answer from the same cached partial answers gives the same result
#[tokio::test]
async fn test_answers_are_deterministic() {
    let store = memory_store();
    let client = Arc::new(corpus_client());
    let pipeline = Pipeline::new(test_config(), store, client.clone());

    let report = pipeline
        .index_corpus(vec![Document::new(SUPPLY_CHAIN_TEXT), Document::new(ENGINE_TEXT)], deadline())
        .await
        .unwrap();
    let query = Query::new(SUPPLY_QUESTION);

    let first = pipeline.query(&report.graph_id, &query, deadline()).await.unwrap();
    let cached = pipeline.query(&report.graph_id, &query, deadline()).await.unwrap();
    assert_eq!(first, cached);
    assert_eq!(client.calls(RequestKind::Map), 2);
    assert_eq!(client.calls(RequestKind::Reduce), 1);

    let answers = CacheKey::stage_prefix(&CacheKey::graph_scope(&report.graph_id), Stage::Answer);
    assert_eq!(pipeline.cache().invalidate(&answers).await.unwrap(), 1);

    let recomputed = pipeline.query(&report.graph_id, &query, deadline()).await.unwrap();
    assert_eq!(first, recomputed);
    assert_eq!(client.calls(RequestKind::Map), 2);
    assert_eq!(client.calls(RequestKind::Reduce), 2);
}

/// A chunk whose output never parses is reported, the rest of the corpus indexes
#[tokio::test]
async fn test_failed_chunk_is_reported() {
    let store = memory_store();
    let client = Arc::new(corpus_client());
    let pipeline = Pipeline::new(test_config(), store, client.clone());
    let broken = Document::new("BROKEN text the model cannot handle.");

    let report = pipeline
        .index_corpus(vec![Document::new(SUPPLY_CHAIN_TEXT), broken.clone()], deadline())
        .await
        .unwrap();

    assert_eq!(report.chunks_total, 2);
    assert_eq!(report.chunks_extracted, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].unit, format!("{}:0", broken.id));
    // first attempt plus one corrective retry for the broken chunk
    assert_eq!(client.calls(RequestKind::Extract), 3);
}

/// Too many failed chunks aborts the index with the failures listed
#[tokio::test]
async fn test_partial_index_below_threshold() {
    let store = memory_store();
    let client = Arc::new(corpus_client());
    let config = test_config().with_min_extraction_success(0.75);
    let pipeline = Pipeline::new(config, store.clone(), client);
    let broken = Document::new("BROKEN text the model cannot handle.");

    let err = pipeline
        .index_corpus(vec![Document::new(SUPPLY_CHAIN_TEXT), broken.clone()], deadline())
        .await
        .unwrap_err();

    match err {
        PipelineError::PartialIndex {
            succeeded,
            total,
            failures,
            ..
        } => {
            assert_eq!((succeeded, total), (1, 2));
            assert_eq!(failures[0].unit, format!("{}:0", broken.id));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(pipeline.list_graphs().await.unwrap().is_empty());
}

/// An exhausted bucket fails every chunk instead of waiting forever
#[tokio::test]
async fn test_bucket_too_small_for_any_call() {
    let store = memory_store();
    let client = Arc::new(corpus_client());
    let config = test_config().with_bucket("tiny", BucketParams::new(5.0, 0.001).unwrap());
    let pipeline = Pipeline::new(config, store, client.clone());

    let err = pipeline.index(Document::new(SUPPLY_CHAIN_TEXT), deadline()).await.unwrap_err();
    assert!(matches!(err, PipelineError::PartialIndex { succeeded: 0, total: 1, .. }));
    assert_eq!(client.calls(RequestKind::Extract), 0);
}

/// Concurrent indexers sharing a store compute every unit once
#[tokio::test]
async fn test_concurrent_indexers_share_work() {
    let store = memory_store();
    let client = Arc::new(corpus_client().with_delay(Duration::from_millis(50)));
    let docs = vec![Document::new(SUPPLY_CHAIN_TEXT), Document::new(ENGINE_TEXT)];

    let mut handles = Vec::new();
    for _ in 0..4 {
        let pipeline = Pipeline::new(test_config(), store.clone(), client.clone() as Arc<dyn CompletionClient>);
        let docs = docs.clone();
        handles.push(tokio::spawn(async move { pipeline.index_corpus(docs, deadline()).await }));
    }

    let mut graph_ids = Vec::new();
    for handle in handles {
        graph_ids.push(handle.await.unwrap().unwrap().graph_id);
    }
    graph_ids.dedup();
    assert_eq!(graph_ids.len(), 1);
    assert_eq!(client.calls(RequestKind::Extract), 2);
    assert_eq!(client.calls(RequestKind::Summarize), 2);
}

/// Concurrent identical queries on one engine share the map and reduce calls
#[tokio::test]
async fn test_concurrent_queries_share_work() {
    let store = memory_store();
    let client = Arc::new(corpus_client().with_delay(Duration::from_millis(20)));
    let pipeline = Arc::new(Pipeline::new(test_config(), store, client.clone()));
    let report = pipeline.index(Document::new(SUPPLY_CHAIN_TEXT), deadline()).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pipeline = pipeline.clone();
        let graph_id = report.graph_id.clone();
        handles.push(tokio::spawn(async move {
            pipeline.query(&graph_id, &Query::new(SUPPLY_QUESTION), deadline()).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().unwrap().text.starts_with("Yes"));
    }
    assert_eq!(client.calls(RequestKind::Map), 1);
    assert_eq!(client.calls(RequestKind::Reduce), 1);
}

/// A missed deadline surfaces as a timeout and leaves nothing cached
#[tokio::test]
async fn test_deadline_leaves_no_partial_entry() {
    let store = memory_store();
    let slow = Arc::new(corpus_client().with_delay(Duration::from_secs(5)));
    let pipeline = Pipeline::new(test_config(), store.clone(), slow);
    let doc = Document::new(SUPPLY_CHAIN_TEXT);

    let err = pipeline
        .index(doc.clone(), Instant::now() + Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::TimeoutExceeded { .. }));

    let chunk = Chunker::new(pipeline.config().chunk).chunk(&doc).remove(0);
    let cached: Option<ExtractionPayload> = pipeline
        .cache()
        .get(&ElementExtractor::cache_key(&chunk))
        .await
        .unwrap();
    assert!(cached.is_none());

    // the abandoned claim does not block a later run
    let fast = Arc::new(corpus_client());
    let retry = Pipeline::new(test_config(), store, fast.clone());
    retry.index(doc, deadline()).await.unwrap();
    assert_eq!(fast.calls(RequestKind::Extract), 1);
}

/// Querying a graph that was never built is an error
#[tokio::test]
async fn test_query_unknown_graph() {
    let pipeline = Pipeline::new(test_config(), memory_store(), Arc::new(corpus_client()));
    let err = pipeline
        .query("0123456789abcdef", &Query::new(SUPPLY_QUESTION), deadline())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotFound(_)));
}

/// Invalidating a document drops its graphs and forces re-extraction
#[tokio::test]
async fn test_invalidate_document() {
    let store = memory_store();
    let client = Arc::new(corpus_client());
    let pipeline = Pipeline::new(test_config(), store, client.clone());
    let doc = Document::new(SUPPLY_CHAIN_TEXT);

    let report = pipeline.index(doc.clone(), deadline()).await.unwrap();
    let removed = pipeline.invalidate_document(&doc.id).await.unwrap();
    assert_eq!(removed.graphs, vec![report.graph_id.clone()]);
    assert!(removed.cache_entries > 0);
    assert!(pipeline.list_graphs().await.unwrap().is_empty());

    let err = pipeline
        .query(&report.graph_id, &Query::new(SUPPLY_QUESTION), deadline())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotFound(_)));

    pipeline.index(doc, deadline()).await.unwrap();
    assert_eq!(client.calls(RequestKind::Extract), 2);
}

/// A second engine on the same database answers from the stored graph
#[tokio::test]
async fn test_graph_survives_engine_restart() {
    let repo = create_test_repo().await;
    let indexer = Pipeline::new(test_config(), repo.clone(), Arc::new(corpus_client()));
    let report = indexer.index(Document::new(SUPPLY_CHAIN_TEXT), deadline()).await.unwrap();

    let client = Arc::new(corpus_client());
    let reader = Pipeline::new(test_config(), repo, client.clone());
    let graphs = reader.list_graphs().await.unwrap();
    assert_eq!(graphs.len(), 1);
    assert_eq!(graphs[0].graph_id, report.graph_id);
    assert_eq!(graphs[0].node_count, 3);

    let answer = reader
        .query(&report.graph_id, &Query::new(SUPPLY_QUESTION), deadline())
        .await
        .unwrap();
    assert!(answer.cites(CommunityId::new(0, 0)));
    assert_eq!(client.calls(RequestKind::Extract), 0);

    let stats = reader.stats().await.unwrap();
    assert_eq!(stats.graphs, 1);
    assert_eq!(stats.nodes, 3);
    assert_eq!(stats.summaries, 1);
}

/// A community summarized during a partial run keeps its summary but takes
/// the id it has once the whole corpus is indexed
#[tokio::test]
async fn test_summaries_follow_renumbered_communities() {
    let store = memory_store();
    let acme_ready = Arc::new(AtomicBool::new(false));
    let ready = acme_ready.clone();
    let client = Arc::new(ScriptedClient::new(move |request| {
        let acme = request.kind == RequestKind::Extract && request.prompt.contains("Acme Corp");
        if acme && !ready.load(Ordering::SeqCst) {
            return Ok("The service is overloaded.".to_string());
        }
        Ok(corpus_reply(request))
    }));
    let pipeline = Pipeline::new(test_config(), store.clone(), client.clone());
    let docs = vec![Document::new(SUPPLY_CHAIN_TEXT), Document::new(ENGINE_TEXT)];

    let partial = pipeline.index_corpus(docs.clone(), deadline()).await.unwrap();
    assert_eq!(partial.failures.len(), 1);
    let first = store.load_summaries(&partial.graph_id, Some(0)).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].community, CommunityId::new(0, 0));
    assert_eq!(first[0].title, "Analytical Engine");

    acme_ready.store(true, Ordering::SeqCst);
    let full = pipeline.index_corpus(docs, deadline()).await.unwrap();
    assert!(full.failures.is_empty());
    assert_eq!(full.graph_id, partial.graph_id);
    assert_eq!(full.summaries, 2);

    let summaries = store.load_summaries(&full.graph_id, Some(0)).await.unwrap();
    let titles: Vec<(CommunityId, &str)> = summaries
        .iter()
        .map(|s| (s.community, s.title.as_str()))
        .collect();
    assert_eq!(
        titles,
        vec![
            (CommunityId::new(0, 0), "Chip supply chain"),
            (CommunityId::new(0, 1), "Analytical Engine"),
        ]
    );
    // The engine community's summary came from the cache
    assert_eq!(client.calls(RequestKind::Summarize), 2);
}

fn long_map_reply(request: &CompletionRequest) -> Result<String, CompletionError> {
    if request.kind != RequestKind::Map {
        return Ok(corpus_reply(request));
    }
    let (sentence, score) = if request.prompt.contains("JapanCo") {
        ("Chips travel from Acme to JapanCo. ", 90)
    } else {
        ("Babbage designed the engine. ", 80)
    };
    Ok(format!(r#"{{"answer": "{}", "score": {}}}"#, sentence.repeat(60), score))
}

/// Partial answers that would overflow the bucket are left out of the
/// reduce prompt, weakest first
#[tokio::test]
async fn test_reduce_prompt_fits_bucket() {
    let store = memory_store();
    let indexer = Pipeline::new(test_config(), store.clone(), Arc::new(ScriptedClient::new(long_map_reply)));
    let report = indexer
        .index_corpus(vec![Document::new(SUPPLY_CHAIN_TEXT), Document::new(ENGINE_TEXT)], deadline())
        .await
        .unwrap();

    let client = Arc::new(ScriptedClient::new(long_map_reply));
    let config = test_config().with_bucket("query", BucketParams::new(800.0, 100_000.0).unwrap());
    let querier = Pipeline::new(config, store, client.clone());
    let answer = querier
        .query(&report.graph_id, &Query::new("What do these documents cover?"), deadline())
        .await
        .unwrap();

    assert_eq!(client.calls(RequestKind::Map), 2);
    assert_eq!(answer.communities, vec![CommunityId::new(0, 0)]);
    let prompts = client.prompts(RequestKind::Reduce);
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("[L0C0]"));
    assert!(!prompts[0].contains("[L0C1]"));
}

/// An entity described in two documents gets one merged description, which
/// the community summary sees in place of the raw ones
#[tokio::test]
async fn test_repeated_entity_gets_merged_description() {
    let store = memory_store();
    let client = Arc::new(corpus_client());
    let pipeline = Pipeline::new(test_config(), store, client.clone());
    let docs = vec![Document::new(SUPPLY_CHAIN_TEXT), Document::new(ROBOTS_TEXT)];

    let report = pipeline.index_corpus(docs.clone(), deadline()).await.unwrap();
    assert_eq!(report.described, 1);
    assert_eq!(client.calls(RequestKind::Describe), 1);

    let graph = pipeline.load_graph(&report.graph_id).await.unwrap();
    let acme = graph.node(&EntityKey::new("Acme Corp", "organization")).unwrap();
    assert_eq!(acme.descriptions.len(), 2);
    assert_eq!(acme.summary.as_deref(), Some(MERGED_ACME_DESCRIPTION));
    assert!(graph.node(&EntityKey::new("Munich", "location")).unwrap().summary.is_none());

    let summary_prompts = client.prompts(RequestKind::Summarize);
    assert_eq!(summary_prompts.len(), 1);
    assert!(summary_prompts[0].contains(MERGED_ACME_DESCRIPTION));
    assert!(!summary_prompts[0].contains("Builds industrial robots"));

    let again = pipeline.index_corpus(docs, deadline()).await.unwrap();
    assert_eq!(again, report);
    assert_eq!(client.calls(RequestKind::Describe), 1);
}

/// Description merging can be switched off
#[tokio::test]
async fn test_description_merging_disabled() {
    let client = Arc::new(corpus_client());
    let config = test_config().with_describe_min_descriptions(0);
    let pipeline = Pipeline::new(config, memory_store(), client.clone());

    let report = pipeline
        .index_corpus(vec![Document::new(SUPPLY_CHAIN_TEXT), Document::new(ROBOTS_TEXT)], deadline())
        .await
        .unwrap();
    assert_eq!(report.described, 0);
    assert_eq!(client.calls(RequestKind::Describe), 0);
}

fn pair_reply(request: &CompletionRequest) -> Result<String, CompletionError> {
    if request.kind == RequestKind::Extract {
        if let Some(n) = (1..=3).find(|n| request.prompt.contains(&format!("Alpha{n} partners"))) {
            return Ok(format!(
                r#"{{"entities": [
                    {{"name": "Alpha{n}", "type": "organization", "description": "First partner"}},
                    {{"name": "Beta{n}", "type": "organization", "description": "Second partner"}}
                ],
                "relationships": [{{"source": "Alpha{n}", "target": "Beta{n}", "description": "partners with"}}]}}"#
            ));
        }
    }
    Ok(corpus_reply(request))
}

/// Communities below the minimum size are pooled into one
#[tokio::test]
async fn test_small_communities_are_pooled() {
    let docs: Vec<Document> = (1..=3)
        .map(|n| Document::new(format!("Alpha{n} partners with Beta{n}.")))
        .collect();

    let client = Arc::new(ScriptedClient::new(pair_reply));
    let pooled = Pipeline::new(test_config(), memory_store(), client.clone());
    let report = pooled.index_corpus(docs.clone(), deadline()).await.unwrap();
    assert_eq!(report.node_count, 6);
    let hierarchy = pooled.load_communities(&report.graph_id).await.unwrap();
    assert_eq!(hierarchy.level(0).len(), 1);
    assert_eq!(hierarchy.level(0)[0].size(), 6);
    assert_eq!(hierarchy.level(0)[0].documents.len(), 3);
    assert_eq!(client.calls(RequestKind::Summarize), 1);

    let separate = Pipeline::new(
        test_config().with_min_community_size(1),
        memory_store(),
        Arc::new(ScriptedClient::new(pair_reply)),
    );
    let split = separate.index_corpus(docs, deadline()).await.unwrap();
    assert_ne!(split.graph_id, report.graph_id);
    let hierarchy = separate.load_communities(&split.graph_id).await.unwrap();
    assert_eq!(hierarchy.level(0).len(), 3);
    assert!(hierarchy.level(0).iter().all(|c| c.size() == 2));
}
