//! Saving and restoring the variables of a graph.
//!
//! A checkpoint is an `.npz` archive holding one array per variable, keyed by
//! the variable name. Next to the archives, a small JSON index keeps track of
//! the steps that were saved, so the most recent one can be found again.
use crate::{
    graph::{Graph, GraphError, NodeId, Shape},
    TensorData,
};
use log::{debug, info};
use ndarray_npy::{NpzReader, NpzWriter, ReadNpzError, WriteNpzError};
use serde_derive::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub type CheckpointResult<T> = Result<T, CheckpointError>;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint file could not be accessed. Filesystem reported error\n {0}.")]
    Io(#[from] io::Error),
    #[error("Checkpoint not readable:\n {0}.")]
    NpzRead(#[from] ReadNpzError),
    #[error("Checkpoint could not be written:\n {0}.")]
    NpzWrite(#[from] WriteNpzError),
    #[error("Checkpoint index is malformed:\n {0}.")]
    Index(#[from] serde_json::Error),
    #[error("Variable {name} could not be read from the checkpoint: {source}")]
    MissingVariable { name: String, source: ReadNpzError },
    #[error("Variable {name} has shape {actual:?} in the checkpoint, the graph expects {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Shape,
        actual: Shape,
    },
    #[error("No checkpoint found in {0}")]
    NoCheckpoint(PathBuf),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Contents of `<prefix>.index.json`.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
struct CheckpointIndex {
    latest: Option<u64>,
    /// Steps with a checkpoint on disk, oldest first
    steps: Vec<u64>,
}

/// Writes all variables of `graph` into an npz archive at `path`.
pub fn save_variables<P: AsRef<Path>>(graph: &Graph, path: P) -> CheckpointResult<()> {
    let mut npz = NpzWriter::new(File::create(path)?);
    for (id, name) in graph.variables() {
        npz.add_array(name, graph.variable_value(id)?)?;
    }
    npz.finish()?;
    Ok(())
}

/// Loads every variable of `graph` from the npz archive at `path`.
/// All variables have to be present with the shape the graph declares,
/// otherwise the graph is left untouched.
pub fn restore_variables<P: AsRef<Path>>(graph: &mut Graph, path: P) -> CheckpointResult<()> {
    let mut reader = NpzReader::new(File::open(path)?)?;
    let mut restored = Vec::new();
    for (id, name) in graph.variables() {
        let value: TensorData =
            reader
                .by_name(name)
                .map_err(|source| CheckpointError::MissingVariable {
                    name: name.to_string(),
                    source,
                })?;
        let expected = graph.shape(id)?;
        if value.shape() != expected {
            return Err(CheckpointError::ShapeMismatch {
                name: name.to_string(),
                expected: expected.to_vec(),
                actual: value.shape().to_vec(),
            });
        }
        restored.push((id, value));
    }

    for (id, value) in restored {
        graph.set_variable_value(id, value)?;
    }
    Ok(())
}

/// Periodically saves graph variables under `<directory>/<prefix>-<step>.npz`,
/// keeping at most `max_to_keep` checkpoints around.
#[derive(Debug, Clone)]
pub struct Saver {
    directory: PathBuf,
    prefix: String,
    /// 0 keeps all checkpoints
    max_to_keep: usize,
}

impl Saver {
    pub fn new<P: Into<PathBuf>>(directory: P, prefix: &str, max_to_keep: usize) -> Saver {
        Saver {
            directory: directory.into(),
            prefix: prefix.to_string(),
            max_to_keep,
        }
    }

    pub fn checkpoint_path(&self, step: u64) -> PathBuf {
        self.directory.join(format!("{}-{}.npz", self.prefix, step))
    }

    fn index_path(&self) -> PathBuf {
        self.directory.join(format!("{}.index.json", self.prefix))
    }

    fn read_index(&self) -> CheckpointResult<CheckpointIndex> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(CheckpointIndex::default());
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    fn write_index(&self, index: &CheckpointIndex) -> CheckpointResult<()> {
        // written next to the index and renamed, so readers never see half a file
        let tmp = self.directory.join(format!("{}.index.json.tmp", self.prefix));
        fs::write(&tmp, serde_json::to_string_pretty(index)?)?;
        fs::rename(tmp, self.index_path())?;
        Ok(())
    }

    /// Saves the current variable values as checkpoint `step` and returns its path.
    pub fn save(&self, graph: &Graph, step: u64) -> CheckpointResult<PathBuf> {
        fs::create_dir_all(&self.directory)?;
        let path = self.checkpoint_path(step);
        save_variables(graph, &path)?;

        let mut index = self.read_index()?;
        index.steps.retain(|&s| s != step);
        index.steps.push(step);
        index.latest = Some(step);
        while self.max_to_keep > 0 && index.steps.len() > self.max_to_keep {
            let old = index.steps.remove(0);
            let old_path = self.checkpoint_path(old);
            debug!("Removing old checkpoint {}", old_path.display());
            match fs::remove_file(&old_path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        self.write_index(&index)?;

        info!("Saved checkpoint {}", path.display());
        Ok(path)
    }

    /// Step and path of the most recent checkpoint, if any was saved.
    pub fn latest(&self) -> CheckpointResult<Option<(u64, PathBuf)>> {
        Ok(self
            .read_index()?
            .latest
            .map(|step| (step, self.checkpoint_path(step))))
    }

    /// Steps that currently have a checkpoint, oldest first.
    pub fn steps(&self) -> CheckpointResult<Vec<u64>> {
        Ok(self.read_index()?.steps)
    }

    pub fn restore<P: AsRef<Path>>(&self, graph: &mut Graph, path: P) -> CheckpointResult<()> {
        restore_variables(graph, path.as_ref())?;
        info!("Restored variables from {}", path.as_ref().display());
        Ok(())
    }

    /// Restores the most recent checkpoint and returns its step.
    pub fn restore_latest(&self, graph: &mut Graph) -> CheckpointResult<u64> {
        let (step, path) = self
            .latest()?
            .ok_or_else(|| CheckpointError::NoCheckpoint(self.directory.clone()))?;
        self.restore(graph, path)?;
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, ArrayD, IxDyn};
    use tempfile::tempdir;

    fn small_graph() -> (Graph, NodeId, NodeId) {
        let mut graph = Graph::new();
        let w = graph
            .variable("encoder_0.weights", array![[1., 2., 3.], [4., 5., 6.]].into_dyn())
            .unwrap();
        graph.placeholder("images", &[1, 2]);
        let b = graph
            .variable("encoder_0.biases", array![7., 8., 9.].into_dyn())
            .unwrap();
        (graph, w, b)
    }

    #[test]
    fn test_save_and_restore() {
        let dir = tempdir().unwrap();
        let saver = Saver::new(dir.path(), "checkpoint.model", 5);
        let (mut graph, w, b) = small_graph();
        let path = saver.save(&graph, 0).unwrap();
        assert_eq!(path, dir.path().join("checkpoint.model-0.npz"));
        assert!(path.exists());

        let original = graph.variable_value(w).unwrap().clone();
        graph
            .set_variable_value(w, ArrayD::zeros(IxDyn(&[2, 3])))
            .unwrap();
        graph.set_variable_value(b, ArrayD::zeros(IxDyn(&[3]))).unwrap();

        assert_eq!(saver.restore_latest(&mut graph).unwrap(), 0);
        assert_eq!(graph.variable_value(w).unwrap(), &original);
        assert_eq!(
            graph.variable_value(b).unwrap(),
            &array![7f32, 8., 9.].into_dyn()
        );
        dir.close().unwrap();
    }

    #[test]
    fn test_retention_and_latest() {
        let dir = tempdir().unwrap();
        let saver = Saver::new(dir.path(), "model", 2);
        let (graph, _, _) = small_graph();
        assert!(saver.latest().unwrap().is_none());

        for step in &[0, 100, 200] {
            saver.save(&graph, *step).unwrap();
        }
        assert_eq!(saver.steps().unwrap(), vec![100, 200]);
        assert!(!saver.checkpoint_path(0).exists());
        assert!(saver.checkpoint_path(100).exists());

        let (step, path) = saver.latest().unwrap().unwrap();
        assert_eq!(step, 200);
        assert_eq!(path, saver.checkpoint_path(200));
        dir.close().unwrap();
    }

    #[test]
    fn test_failed_restore_leaves_graph_untouched() {
        let dir = tempdir().unwrap();
        let saver = Saver::new(dir.path(), "model", 0);
        let (graph, _, _) = small_graph();
        saver.save(&graph, 0).unwrap();

        // weights match, biases come after them and do not
        let mut other = Graph::new();
        let w = other
            .variable("encoder_0.weights", ArrayD::zeros(IxDyn(&[2, 3])))
            .unwrap();
        let b = other
            .variable("encoder_0.biases", ArrayD::zeros(IxDyn(&[4])))
            .unwrap();
        assert!(matches!(
            saver.restore_latest(&mut other),
            Err(CheckpointError::ShapeMismatch { .. })
        ));
        assert_eq!(other.variable_value(w).unwrap().sum(), 0.0);
        assert_eq!(other.variable_value(b).unwrap().sum(), 0.0);
        dir.close().unwrap();
    }

    #[test]
    fn test_restore_errors() {
        let dir = tempdir().unwrap();
        let saver = Saver::new(dir.path(), "model", 0);
        let (mut graph, _, _) = small_graph();
        assert!(matches!(
            saver.restore_latest(&mut graph),
            Err(CheckpointError::NoCheckpoint(_))
        ));
        saver.save(&graph, 3).unwrap();

        // same names, different shapes
        let mut reshaped = Graph::new();
        reshaped
            .variable("encoder_0.weights", ArrayD::zeros(IxDyn(&[3, 2])))
            .unwrap();
        match saver.restore_latest(&mut reshaped) {
            Err(CheckpointError::ShapeMismatch { name, .. }) => {
                assert_eq!(name, "encoder_0.weights")
            }
            other => panic!("unexpected result {:?}", other),
        }

        let mut extended = Graph::new();
        extended
            .variable("decoder_0.weights", ArrayD::zeros(IxDyn(&[2])))
            .unwrap();
        assert!(matches!(
            saver.restore_latest(&mut extended),
            Err(CheckpointError::MissingVariable { .. })
        ));
        dir.close().unwrap();
    }
}
