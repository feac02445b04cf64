use std::path::PathBuf;

use cmi::{
    init_logging, log_app_start, logging_config_from_env, pipeline_config_from_env,
    EmbeddingStore, PipelineContext, PredictorKind,
};

/// Usage: `cmi_train [EMBEDDINGS_JSON]`. Trains every scorer and predictor on the
/// configured price source, then optionally imports an embeddings JSON array.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("cmi_train", &logging_cfg);

    let config = pipeline_config_from_env();
    let embeddings_json = std::env::args().nth(1).map(PathBuf::from);
    let embedding_store_path = config.embedding_store_path.clone();

    let context = PipelineContext::open(config)?;
    for summary in context.train_anomaly_models()? {
        println!("trained {} on {} rows", summary.model_name, summary.rows);
    }
    for kind in PredictorKind::ALL {
        let summary = context.train_predictor(kind)?;
        println!("trained {} on {} rows", summary.model_name, summary.rows);
    }
    context.shutdown();

    if let Some(path) = embeddings_json {
        let store = EmbeddingStore::open(&embedding_store_path)?;
        let imported = store.import_json(&path)?;
        println!("imported {imported} embeddings from {}", path.display());
    }
    Ok(())
}
