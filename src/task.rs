//! ARC Task Representation
//!
//! A `Task` is the read-only view of one ARC problem that the model is fitted
//! to: every example grid padded to a common size, per-cell validity masks,
//! per-example shapes and the size flags that decide how masked aggregation
//! and grid-size marginalization behave.

use ndarray::{Array3, Array4};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use candle_core::{Device, Result as CandleResult, Tensor};

/// A raw ARC grid, indexed `[row][column]`. Rows map to the model's x axis.
pub type Grid = Vec<Vec<u8>>;

/// Input mode index along the trailing mode axis.
pub const INPUT_MODE: usize = 0;
/// Output mode index along the trailing mode axis.
pub const OUTPUT_MODE: usize = 1;

#[derive(Debug, Error, PartialEq)]
pub enum TaskError {
    #[error("task has no training examples")]
    NoTrainingExamples,
    #[error("grid {0} is empty")]
    EmptyGrid(String),
    #[error("grid {0} has rows of different lengths")]
    RaggedGrid(String),
    #[error("grid {grid} uses color {color}, ARC colors are 0..=9")]
    ColorOutOfRange { grid: String, color: u8 },
    #[error("invalid task json: {0}")]
    Json(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PairFile {
    input: Grid,
    #[serde(default)]
    output: Option<Grid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskFile {
    train: Vec<PairFile>,
    #[serde(default)]
    test: Vec<PairFile>,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub n_examples: usize,
    pub n_train: usize,
    /// Number of non-background colors the model predicts.
    pub n_colors: usize,
    pub n_x: usize,
    pub n_y: usize,
    /// Original ARC color for each compacted color index.
    pub colors: Vec<u8>,
    /// Compacted color indices, `[example, x, y, mode]`, zero outside the shape.
    pub problem: Array4<u32>,
    /// 1.0 where a cell lies inside the example's grid, `[example, x, y, mode]`.
    pub masks: Array4<f32>,
    /// `shapes[example][mode] = [len_x, len_y]`.
    pub shapes: Vec<[[usize; 2]; 2]>,
    pub in_out_same_size: bool,
    pub all_in_same_size: bool,
    pub all_out_same_size: bool,
}

fn grid_shape(grid: &Grid, name: &str) -> Result<[usize; 2], TaskError> {
    let rows = grid.len();
    let cols = grid.first().map(|r| r.len()).unwrap_or(0);
    if rows == 0 || cols == 0 {
        return Err(TaskError::EmptyGrid(name.to_string()));
    }
    if grid.iter().any(|r| r.len() != cols) {
        return Err(TaskError::RaggedGrid(name.to_string()));
    }
    if let Some(&color) = grid.iter().flatten().find(|&&c| c > 9) {
        return Err(TaskError::ColorOutOfRange { grid: name.to_string(), color });
    }
    Ok([rows, cols])
}

fn all_equal(shapes: &[[usize; 2]]) -> bool {
    shapes.windows(2).all(|w| w[0] == w[1])
}

impl Task {
    /// Builds a task from training pairs and test inputs.
    pub fn from_examples(train: &[(Grid, Grid)], test: &[Grid]) -> Result<Self, TaskError> {
        if train.is_empty() {
            return Err(TaskError::NoTrainingExamples);
        }
        let n_train = train.len();
        let n_examples = n_train + test.len();

        let mut in_shapes = Vec::with_capacity(n_examples);
        let mut out_shapes = Vec::with_capacity(n_train);
        for (i, (input, output)) in train.iter().enumerate() {
            in_shapes.push(grid_shape(input, &format!("train[{}].input", i))?);
            out_shapes.push(grid_shape(output, &format!("train[{}].output", i))?);
        }
        for (i, input) in test.iter().enumerate() {
            in_shapes.push(grid_shape(input, &format!("test[{}].input", i))?);
        }

        let in_out_same_size = (0..n_train).all(|i| in_shapes[i] == out_shapes[i]);
        let all_in_same_size = all_equal(&in_shapes);
        let all_out_same_size = all_equal(&out_shapes);

        let known = in_shapes.iter().chain(out_shapes.iter());
        let n_x = known.clone().map(|s| s[0]).max().unwrap_or(1);
        let n_y = known.map(|s| s[1]).max().unwrap_or(1);

        let mut shapes = Vec::with_capacity(n_examples);
        for i in 0..n_examples {
            let output_shape = if i < n_train {
                out_shapes[i]
            } else if in_out_same_size {
                in_shapes[i]
            } else if all_out_same_size {
                out_shapes[0]
            } else {
                [n_x, n_y]
            };
            shapes.push([in_shapes[i], output_shape]);
        }

        let mut colors: Vec<u8> = train
            .iter()
            .flat_map(|(i, o)| i.iter().chain(o.iter()))
            .chain(test.iter().flat_map(|g| g.iter()))
            .flatten()
            .copied()
            .chain(std::iter::once(0))
            .collect();
        colors.sort_unstable();
        colors.dedup();
        let mut color_index = [0u32; 10];
        for (idx, &c) in colors.iter().enumerate() {
            color_index[c as usize] = idx as u32;
        }
        let n_colors = (colors.len() - 1).max(1);

        let mut problem = Array4::<u32>::zeros((n_examples, n_x, n_y, 2));
        let mut masks = Array4::<f32>::zeros((n_examples, n_x, n_y, 2));
        for (e, shape) in shapes.iter().enumerate() {
            let grids: [Option<&Grid>; 2] = if e < n_train {
                [Some(&train[e].0), Some(&train[e].1)]
            } else {
                [Some(&test[e - n_train]), None]
            };
            for mode in 0..2 {
                let [lx, ly] = shape[mode];
                for x in 0..lx {
                    for y in 0..ly {
                        masks[[e, x, y, mode]] = 1.0;
                        if let Some(grid) = grids[mode] {
                            problem[[e, x, y, mode]] = color_index[grid[x][y] as usize];
                        }
                    }
                }
            }
        }

        Ok(Self {
            n_examples,
            n_train,
            n_colors,
            n_x,
            n_y,
            colors,
            problem,
            masks,
            shapes,
            in_out_same_size,
            all_in_same_size,
            all_out_same_size,
        })
    }

    /// Parses the ARC JSON layout `{"train": [{"input", "output"}], "test": [{"input"}]}`.
    pub fn from_json(content: &str) -> Result<Self, TaskError> {
        let file: TaskFile =
            serde_json::from_str(content).map_err(|e| TaskError::Json(e.to_string()))?;
        let mut train = Vec::with_capacity(file.train.len());
        for (i, pair) in file.train.into_iter().enumerate() {
            let output = pair
                .output
                .ok_or_else(|| TaskError::Json(format!("train[{}] has no output", i)))?;
            train.push((pair.input, output));
        }
        let test: Vec<Grid> = file.test.into_iter().map(|p| p.input).collect();
        Self::from_examples(&train, &test)
    }

    /// Whether every grid in the task, test inputs included, has one common size.
    pub fn uniform_grid_size(&self) -> bool {
        self.in_out_same_size && self.all_in_same_size && self.all_out_same_size
    }

    /// Whether spatial reductions may use the position masks.
    pub fn masked_aggregation(&self) -> bool {
        self.in_out_same_size || self.all_out_same_size
    }

    /// Whether the grid size for `mode` is fixed by the task's size invariants.
    pub fn grid_size_known(&self, mode: usize) -> bool {
        self.in_out_same_size
            || (self.all_out_same_size && mode == OUTPUT_MODE)
            || (self.all_in_same_size && mode == INPUT_MODE)
    }

    /// A cell counts as valid if it is valid in either mode: `1 - (1 - m_in)(1 - m_out)`.
    pub fn combined_mask(&self) -> Array3<f32> {
        let mut combined = Array3::<f32>::zeros((self.n_examples, self.n_x, self.n_y));
        for ((e, x, y), v) in combined.indexed_iter_mut() {
            let m_in = self.masks[[e, x, y, INPUT_MODE]];
            let m_out = self.masks[[e, x, y, OUTPUT_MODE]];
            *v = 1.0 - (1.0 - m_in) * (1.0 - m_out);
        }
        combined
    }

    /// `combined_mask` as a `[example, x, y]` tensor.
    pub fn combined_mask_tensor(&self, device: &Device) -> CandleResult<Tensor> {
        let mask = self.combined_mask();
        let dims = mask.shape().to_vec();
        Tensor::from_vec(mask.iter().copied().collect::<Vec<f32>>(), dims, device)
    }

    /// Target color indices for one example and mode, cropped to its shape.
    pub fn target(&self, example: usize, mode: usize, device: &Device) -> CandleResult<Tensor> {
        let [lx, ly] = self.shapes[example][mode];
        let mut data = Vec::with_capacity(lx * ly);
        for x in 0..lx {
            for y in 0..ly {
                data.push(self.problem[[example, x, y, mode]]);
            }
        }
        Tensor::from_vec(data, (lx, ly), device)
    }
}
