// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Checkpoint persistence for parameter state dicts.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::{MirrorResult, MirrorRlError};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredTensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl StoredTensor {
    fn from_tensor(tensor: &Array2<f32>) -> StoredTensor {
        StoredTensor {
            rows: tensor.nrows(),
            cols: tensor.ncols(),
            data: tensor.iter().copied().collect(),
        }
    }

    fn into_tensor(self) -> MirrorResult<Array2<f32>> {
        Array2::from_shape_vec((self.rows, self.cols), self.data).map_err(|_| {
            MirrorRlError::InvalidDimensions {
                rows: self.rows,
                cols: self.cols,
            }
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PolicySnapshot {
    parameters: HashMap<String, StoredTensor>,
}

fn to_snapshot(state: &HashMap<String, Array2<f32>>) -> PolicySnapshot {
    let mut parameters = HashMap::new();
    for (name, tensor) in state {
        parameters.insert(name.clone(), StoredTensor::from_tensor(tensor));
    }
    PolicySnapshot { parameters }
}

fn from_snapshot(snapshot: PolicySnapshot) -> MirrorResult<HashMap<String, Array2<f32>>> {
    let mut state = HashMap::new();
    for (name, tensor) in snapshot.parameters.into_iter() {
        state.insert(name, tensor.into_tensor()?);
    }
    Ok(state)
}

fn io_error(err: std::io::Error) -> MirrorRlError {
    MirrorRlError::IoError {
        message: err.to_string(),
    }
}

fn serde_error(err: impl ToString) -> MirrorRlError {
    MirrorRlError::SerializationError {
        message: err.to_string(),
    }
}

pub fn save_json<P: AsRef<Path>>(
    state: &HashMap<String, Array2<f32>>,
    path: P,
) -> MirrorResult<()> {
    let file = File::create(path.as_ref()).map_err(io_error)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, &to_snapshot(state)).map_err(serde_error)?;
    Ok(())
}

pub fn load_json<P: AsRef<Path>>(path: P) -> MirrorResult<HashMap<String, Array2<f32>>> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let reader = BufReader::new(file);
    let snapshot: PolicySnapshot = serde_json::from_reader(reader).map_err(serde_error)?;
    from_snapshot(snapshot)
}

pub fn save_bincode<P: AsRef<Path>>(
    state: &HashMap<String, Array2<f32>>,
    path: P,
) -> MirrorResult<()> {
    let file = File::create(path.as_ref()).map_err(io_error)?;
    let writer = BufWriter::new(file);
    bincode::serialize_into(writer, &to_snapshot(state)).map_err(serde_error)?;
    Ok(())
}

pub fn load_bincode<P: AsRef<Path>>(path: P) -> MirrorResult<HashMap<String, Array2<f32>>> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let reader = BufReader::new(file);
    let snapshot: PolicySnapshot = bincode::deserialize_from(reader).map_err(serde_error)?;
    from_snapshot(snapshot)
}
