use std::collections::BTreeMap;

use cmi::{
    cosine_similarity, top_k_similar, Embedder, EmbeddingRecord, HashingEmbedder, RetrievalError,
};

fn record(text: &str, embedding: Vec<f32>) -> EmbeddingRecord {
    let mut metadata = BTreeMap::new();
    metadata.insert("source".to_string(), serde_json::json!("notes"));
    EmbeddingRecord {
        text: text.to_string(),
        metadata,
        embedding,
    }
}

fn corpus() -> Vec<EmbeddingRecord> {
    vec![
        record("east", vec![1.0, 0.0, 0.0]),
        record("north-east", vec![1.0, 1.0, 0.0]),
        record("north", vec![0.0, 1.0, 0.0]),
        record("west", vec![-1.0, 0.0, 0.0]),
        record("blank", vec![0.0, 0.0, 0.0]),
    ]
}

#[test]
fn cosine_is_one_for_self_and_symmetric() {
    let a = [0.3f32, -1.2, 4.0, 0.5];
    let b = [2.0f32, 0.1, -0.7, 1.5];

    assert!((cosine_similarity(&a, &a).unwrap() - 1.0).abs() < 1e-12);
    assert_eq!(
        cosine_similarity(&a, &b).unwrap(),
        cosine_similarity(&b, &a).unwrap()
    );
    assert_eq!(cosine_similarity(&a, &[0.0; 4]).unwrap(), 0.0);
    assert!(matches!(
        cosine_similarity(&a, &b[..3]),
        Err(RetrievalError::DimensionMismatch {
            expected: 4,
            actual: 3
        })
    ));
}

#[test]
fn results_are_ranked_and_capped() {
    let corpus = corpus();
    let results = top_k_similar(&[1.0, 0.2, 0.0], &corpus, 3).unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].text, "east");
    assert_eq!(results[1].text, "north-east");
    assert!(results.windows(2).all(|pair| pair[0].score >= pair[1].score));
    assert_eq!(results[0].metadata["source"], "notes");

    let everything = top_k_similar(&[1.0, 0.2, 0.0], &corpus, 50).unwrap();
    assert_eq!(everything.len(), corpus.len());
    assert_eq!(everything.last().unwrap().text, "west");
    assert!(top_k_similar(&[1.0, 0.2, 0.0], &corpus, 0).unwrap().is_empty());
    assert!(top_k_similar(&[1.0, 0.2, 0.0], &[], 3).unwrap().is_empty());
}

#[test]
fn zero_corpus_vectors_score_zero_but_zero_queries_fail() {
    let corpus = corpus();
    let results = top_k_similar(&[0.0, 0.0, 1.0], &corpus, 5).unwrap();
    assert!(results.iter().all(|r| r.score == 0.0));
    assert_eq!(results[0].text, "east");

    assert!(matches!(
        top_k_similar(&[0.0, 0.0, 0.0], &corpus, 3),
        Err(RetrievalError::DegenerateVector(_))
    ));
    assert!(matches!(
        top_k_similar(&[f32::NAN, 1.0, 0.0], &corpus, 3),
        Err(RetrievalError::DegenerateVector(_))
    ));
}

#[test]
fn hashing_embedder_is_deterministic_and_normalised() {
    let embedder = HashingEmbedder::new(64);
    let a = embedder.embed("Bitcoin rallies after ETF approval").unwrap();
    let b = embedder.embed("bitcoin RALLIES after etf approval").unwrap();
    let c = embedder.embed("funding rates turned negative").unwrap();

    assert_eq!(embedder.dimension(), 64);
    assert_eq!(a, b);
    let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-5);

    let corpus = vec![
        record("funding", c),
        record("etf", embedder.embed("ETF approval drives bitcoin").unwrap()),
    ];
    let results = top_k_similar(&a, &corpus, 1).unwrap();
    assert_eq!(results[0].text, "etf");

    assert!(matches!(
        embedder.embed("  ... "),
        Err(RetrievalError::DegenerateVector(_))
    ));
}
