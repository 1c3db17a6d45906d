use std::path::Path;

use tensorboard_rs::summary_writer::SummaryWriter;

/// Writes per-evaluation scalars as TensorBoard event files. The step is
/// the epoch index.
pub struct TensorBoardLogger {
    writer: SummaryWriter,
}

impl TensorBoardLogger {
    pub fn new(log_dir: &Path) -> Self {
        Self {
            writer: SummaryWriter::new(log_dir),
        }
    }

    /// Records `train/*` and `test/*` loss and accuracy for `epoch`.
    pub fn log_evaluation(&mut self, epoch: usize, train: (f32, f32), test: (f32, f32)) {
        for (split, (loss, acc)) in [("train", train), ("test", test)] {
            self.writer.add_scalar(&format!("{split}/loss"), loss, epoch);
            self.writer.add_scalar(&format!("{split}/accuracy"), acc, epoch);
        }
    }

    pub fn flush(&mut self) {
        self.writer.flush();
    }
}

impl Drop for TensorBoardLogger {
    fn drop(&mut self) {
        self.writer.flush();
    }
}
