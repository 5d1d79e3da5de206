use std::io::Write;
use std::sync::Mutex;

use async_trait::async_trait;
use parkflow_core::Batch;

use crate::error::{SinkError, SinkResult};
use crate::{Sink, SinkKind};

const HEADERS: [&str; 4] = ["facility_key", "available_spaces", "closed", "observed_at"];

/// Observation sink that prints each batch as a table.
pub struct ConsoleSink {
    name: String,
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleSink {
    pub fn stdout(name: impl Into<String>) -> Self {
        Self::with_writer(name, Box::new(std::io::stdout()))
    }

    pub fn with_writer(name: impl Into<String>, out: Box<dyn Write + Send>) -> Self {
        Self {
            name: name.into(),
            out: Mutex::new(out),
        }
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Observation
    }

    async fn commit(&self, batch: &Batch) -> SinkResult<()> {
        let rendered = render_batch(batch);
        let mut out = self
            .out
            .lock()
            .map_err(|_| SinkError::Connection("console writer poisoned".into()))?;
        out.write_all(rendered.as_bytes())?;
        out.flush()?;
        Ok(())
    }
}

/// Render a batch as a boxed table under a `Batch: <seq>` banner.
pub fn render_batch(batch: &Batch) -> String {
    let cells: Vec<[String; 4]> = batch
        .rows
        .iter()
        .map(|r| {
            [
                r.facility_key.clone(),
                r.available_spaces.to_string(),
                r.closed.to_string(),
                r.observed_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "null".into()),
            ]
        })
        .collect();

    let mut widths = HEADERS.map(str::len);
    for row in &cells {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let border = format!(
        "+{}+\n",
        widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("+")
    );
    let line = |values: &[String]| {
        let padded: Vec<String> = values
            .iter()
            .zip(widths.iter())
            .map(|(v, w)| format!("{:<width$}", v, width = *w))
            .collect();
        format!("|{}|\n", padded.join("|"))
    };

    let mut out = String::new();
    out.push_str("-------------------------------------------\n");
    out.push_str(&format!("Batch: {}\n", batch.seq));
    out.push_str("-------------------------------------------\n");
    out.push_str(&border);
    out.push_str(&line(&HEADERS.map(String::from)[..]));
    out.push_str(&border);
    for row in &cells {
        out.push_str(&line(&row[..]));
    }
    out.push_str(&border);
    out.push('\n');
    out
}
