use crate::pipeline::tracking::PredictionGraph;
use anyhow::Result;
use ndarray::Array2;
use std::io::Write;

pub const EDGE_COLUMNS: [&str; 5] = ["source_t", "source_label", "target_t", "target_label", "weight"];

/// Flat numeric form of a prediction graph, one row per edge.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeTable {
    /// `[edges, 5]`, columns as in `EDGE_COLUMNS`
    pub rows: Array2<f32>,
}

impl EdgeTable {
    /// Edges without a score get weight 1.0.
    pub fn from_graph(graph: &PredictionGraph) -> Self {
        let mut rows = Array2::<f32>::zeros((graph.edge_count(), EDGE_COLUMNS.len()));
        for (mut row, (source, target, weight)) in rows.outer_iter_mut().zip(graph.edges()) {
            row[0] = source.timepoint as f32;
            row[1] = source.label as f32;
            row[2] = target.timepoint as f32;
            row[3] = target.label as f32;
            row[4] = weight.unwrap_or(1.0);
        }
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.nrows() == 0
    }

    /// Write the table as CSV with a header row.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(EDGE_COLUMNS)?;
        for row in self.rows.outer_iter() {
            wtr.write_record(row.iter().map(|v| v.to_string()))?;
        }
        wtr.flush()?;
        Ok(())
    }
}
