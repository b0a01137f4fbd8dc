use std::path::Path;

use serde_json::{json, Map, Value};

use crate::evaluator::EvalOutcome;

/// Write the final results JSON. The layout matches what the platform's
/// upload endpoint ingests, so a run that never streamed can be backfilled
/// from this file.
pub fn write_results_file(
    path: impl AsRef<Path>,
    dataset_name: &str,
    run_name: &str,
    metrics: &[String],
    outcome: &EvalOutcome,
) -> std::io::Result<()> {
    let mut inputs = Map::new();
    let mut metadatas = Map::new();
    let mut results = Map::new();
    let mut errors = Map::new();

    for (item_id, result) in &outcome.results {
        inputs.insert(item_id.clone(), result.input.clone());
        metadatas.insert(item_id.clone(), result.item_metadata.clone());

        let mut scores = Map::new();
        for (metric, score) in &result.scores {
            let value = if score.metadata.is_empty() && !score.errored {
                score.score.map(|s| json!(s)).unwrap_or(Value::Null)
            } else {
                json!({ "score": score.score, "metadata": score.metadata })
            };
            scores.insert(metric.clone(), value);
        }

        results.insert(
            item_id.clone(),
            json!({
                "output": result.output,
                "expected": result.expected,
                "time": result.time_seconds,
                "trace_id": result.trace_id,
                "trace_url": result.trace_url,
                "scores": scores,
            }),
        );
    }

    for (item_id, failure) in &outcome.errors {
        inputs
            .entry(item_id.clone())
            .or_insert_with(|| failure.input.clone());
        metadatas
            .entry(item_id.clone())
            .or_insert_with(|| failure.item_metadata.clone());
        errors.insert(
            item_id.clone(),
            json!({ "error": failure.error, "trace_id": failure.trace_id }),
        );
    }

    let document = json!({
        "dataset_name": dataset_name,
        "run_name": run_name,
        "metrics": metrics,
        "inputs": inputs,
        "metadatas": metadatas,
        "results": results,
        "errors": errors,
        "summary": outcome.summary,
    });

    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, serde_json::to_string_pretty(&document)?)
}
