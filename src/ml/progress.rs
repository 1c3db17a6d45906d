//! Training progress display.
//!
//! With the `progress` feature an `indicatif` bar tracks batches within the
//! current epoch; without it every call is a no-op and epoch summaries are
//! left to the `tracing` output.

#[cfg(feature = "progress")]
use indicatif::{ProgressBar, ProgressStyle};

/// Training progress tracker
pub struct TrainingProgress {
    num_epochs: usize,
    batches_per_epoch: usize,
    current_epoch: usize,
    #[cfg(feature = "progress")]
    bar: Option<ProgressBar>,
}

impl TrainingProgress {
    pub fn new(num_epochs: usize, batches_per_epoch: usize) -> Self {
        Self {
            num_epochs,
            batches_per_epoch,
            current_epoch: 0,
            #[cfg(feature = "progress")]
            bar: None,
        }
    }

    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }

    pub fn start_epoch(&mut self) {
        self.current_epoch += 1;
        #[cfg(feature = "progress")]
        {
            let bar = ProgressBar::new(self.batches_per_epoch as u64);
            if let Ok(style) = ProgressStyle::with_template(
                "{prefix} [{bar:30}] {pos}/{len} batches {msg}",
            ) {
                bar.set_style(style.progress_chars("=> "));
            }
            bar.set_prefix(format!("epoch {}/{}", self.current_epoch, self.num_epochs));
            self.bar = Some(bar);
        }
    }

    #[cfg_attr(not(feature = "progress"), allow(unused_variables))]
    pub fn update_batch(&mut self, loss: f32) {
        #[cfg(feature = "progress")]
        if let Some(bar) = &self.bar {
            bar.set_message(format!("loss {loss:.4}"));
            bar.inc(1);
        }
    }

    pub fn finish_epoch(&mut self) {
        #[cfg(feature = "progress")]
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }

    pub fn finish(&mut self) {
        self.finish_epoch();
    }
}

impl Drop for TrainingProgress {
    fn drop(&mut self) {
        self.finish_epoch();
    }
}
