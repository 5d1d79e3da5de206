use std::sync::Arc;

use parkflow_config::{SinkEndpoint, SinkSpec};
use parkflow_pg::PostgresSink;
use parkflow_sink::{ConsoleSink, JsonlSink, Sink};
use tracing::info;

use crate::error::{PipelineError, PipelineResult};

/// Instantiate the configured sinks. Postgres sinks connect here, so an
/// unreachable database fails startup.
pub async fn build_sinks(specs: &[SinkSpec], pg_table: &str) -> PipelineResult<Vec<Arc<dyn Sink>>> {
    let mut sinks: Vec<Arc<dyn Sink>> = Vec::with_capacity(specs.len());

    for spec in specs {
        let sink: Arc<dyn Sink> = match &spec.endpoint {
            SinkEndpoint::Console => Arc::new(ConsoleSink::stdout(&spec.name)),
            SinkEndpoint::File { path } => Arc::new(JsonlSink::new(&spec.name, path)),
            SinkEndpoint::Postgres { url } => Arc::new(
                PostgresSink::connect(&spec.name, url.as_str(), pg_table)
                    .await
                    .map_err(|e| PipelineError::Sink {
                        sink: spec.name.clone(),
                        source: e.into(),
                    })?,
            ),
        };
        info!(sink = %spec.name, kind = sink.kind().as_str(), endpoint = %spec.endpoint, "Sink configured");
        sinks.push(sink);
    }

    Ok(sinks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parkflow_sink::SinkKind;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_build_local_sinks() {
        let specs = vec![
            SinkSpec {
                name: "console".into(),
                endpoint: SinkEndpoint::Console,
            },
            SinkSpec {
                name: "archive".into(),
                endpoint: SinkEndpoint::File {
                    path: PathBuf::from("changes.jsonl"),
                },
            },
        ];

        let sinks = build_sinks(&specs, "parking_data").await.unwrap();
        let kinds: Vec<_> = sinks.iter().map(|s| (s.name().to_string(), s.kind())).collect();
        assert_eq!(
            kinds,
            vec![
                ("console".to_string(), SinkKind::Observation),
                ("archive".to_string(), SinkKind::Durable),
            ]
        );
    }
}
