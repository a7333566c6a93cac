//! Matmul row-tile autotuning
//!
//! Each distinct matmul problem is benchmarked once per tuner on the tuning
//! device; later compiles reuse the recorded choice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use common::error::Result;
use device_runtime::{Device, Kernel, TensorSpec};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::ir::{Graph, NodeKind};
use crate::program::TuningRecord;

/// Row tiles tried for every problem, in addition to the untiled kernel
pub const CANDIDATE_TILES: [usize; 4] = [1, 8, 32, 128];

const DEFAULT_ITERATIONS: usize = 3;

pub struct MatmulAutotuner {
    device: Arc<Device>,
    iterations: usize,
    records: Mutex<HashMap<String, TuningRecord>>,
}

impl MatmulAutotuner {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            iterations: DEFAULT_ITERATIONS,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations.max(1);
        self
    }

    /// Chooses a row tile for every untuned matmul in the graph
    pub fn tune(&self, graph: &mut Graph) -> Result<Vec<TuningRecord>> {
        let mut used = Vec::new();

        for index in 0..graph.nodes.len() {
            let (transpose_rhs, lhs, rhs) = match &graph.nodes[index].kind {
                NodeKind::Kernel {
                    kernel:
                        Kernel::Matmul {
                            transpose_rhs,
                            row_tile: None,
                        },
                    operands,
                } => (
                    *transpose_rhs,
                    graph.nodes[operands[0].0].spec.clone(),
                    graph.nodes[operands[1].0].spec.clone(),
                ),
                _ => continue,
            };

            let problem = format!(
                "{} x {}{}",
                lhs,
                rhs,
                if transpose_rhs { "^T" } else { "" }
            );
            let cached = self.records.lock().get(&problem).cloned();
            let record = match cached {
                Some(record) => record,
                None => {
                    let record = self.benchmark(&problem, &lhs, &rhs, transpose_rhs)?;
                    self.records.lock().insert(problem.clone(), record.clone());
                    record
                }
            };

            if let NodeKind::Kernel {
                kernel: Kernel::Matmul { row_tile, .. },
                ..
            } = &mut graph.nodes[index].kind
            {
                *row_tile = Some(record.chosen);
            }
            if !used.iter().any(|r: &TuningRecord| r.problem == record.problem) {
                used.push(record);
            }
        }

        Ok(used)
    }

    fn benchmark(&self, problem: &str, lhs: &TensorSpec, rhs: &TensorSpec, transpose_rhs: bool) -> Result<TuningRecord> {
        let rows = lhs.shape.dim(-2).unwrap_or(1);
        let mut tiles: Vec<usize> = CANDIDATE_TILES.iter().copied().filter(|&t| t < rows).collect();
        tiles.push(rows);

        let stream = self.device.new_stream();
        let a = self.device.full(lhs.shape.clone(), lhs.dtype, 0.5)?;
        let b = self.device.full(rhs.shape.clone(), rhs.dtype, 0.25)?;

        let mut candidates = Vec::with_capacity(tiles.len());
        for tile in tiles {
            let kernel = Kernel::Matmul {
                transpose_rhs,
                row_tile: Some(tile),
            };
            let spec = kernel.output_spec(&[lhs.clone(), rhs.clone()])?;
            let out = self.device.allocate(spec.shape, spec.dtype)?;

            // Warm up once before timing
            stream.launch(kernel.clone(), &[&a, &b], &out)?;
            stream.synchronize()?;

            let start = Instant::now();
            for _ in 0..self.iterations {
                stream.launch(kernel.clone(), &[&a, &b], &out)?;
            }
            stream.synchronize()?;
            let micros = start.elapsed().as_micros() as u64 / self.iterations as u64;
            debug!("{} tile {}: {}µs", problem, tile, micros);
            candidates.push((tile, micros));
        }

        let chosen = candidates
            .iter()
            .min_by_key(|(_, micros)| *micros)
            .map(|(tile, _)| *tile)
            .unwrap_or(rows);
        info!("Autotuned {}: row tile {}", problem, chosen);

        Ok(TuningRecord {
            problem: problem.to_string(),
            candidates,
            chosen,
        })
    }
}
