use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::model::loss::{count_correct, cross_entropy};
use crate::model::optim::Adam;
use crate::model::Model;
use crate::pipeline::Pipeline;

/// Mean loss and accuracy of one training epoch
#[derive(Debug, Clone, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    pub loss: f32,
    pub accuracy: f32,
    pub duration: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct History {
    pub epochs: Vec<EpochStats>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub loss: f32,
    pub accuracy: f32,
    pub mistakes: usize,
    pub examples: usize,
}

/// Running sample-weighted totals over a sequence of batches
#[derive(Debug, Default)]
struct Totals {
    loss: f64,
    correct: usize,
    examples: usize,
}

impl Totals {
    fn add(&mut self, loss: f32, correct: usize, examples: usize) {
        self.loss += loss as f64 * examples as f64;
        self.correct += correct;
        self.examples += examples;
    }

    fn mean_loss(&self) -> f32 {
        (self.loss / self.examples.max(1) as f64) as f32
    }

    fn accuracy(&self) -> f32 {
        self.correct as f32 / self.examples.max(1) as f32
    }
}

/// A model paired with its optimizer
pub struct Trainer<M: Model> {
    model: M,
    optimizer: Adam,
}

impl<M: Model> Trainer<M> {
    pub fn new(model: M, optimizer: Adam) -> Trainer<M> {
        Trainer { model, optimizer }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Train for `epochs` passes over the pipeline, logging one line per epoch
    pub fn fit(&mut self, pipeline: &Pipeline, epochs: usize) -> Result<History> {
        if pipeline.is_empty() {
            return Err(Error::EmptyDataset);
        }

        let mut history = History::default();

        for epoch in 0..epochs {
            let start = Instant::now();
            let mut totals = Totals::default();

            for batch in pipeline.epoch(epoch) {
                let batch = batch?;
                let step = self.model.train_step(&batch, &mut self.optimizer)?;
                totals.add(step.loss, step.correct, batch.labels.len());
                tracing::trace!(
                    "epoch {} step {} loss {:.4}",
                    epoch + 1,
                    self.optimizer.steps(),
                    step.loss
                );
            }

            let stats = EpochStats {
                epoch,
                loss: totals.mean_loss(),
                accuracy: totals.accuracy(),
                duration: start.elapsed(),
            };
            tracing::info!(
                "Epoch {}/{} - {}s - loss: {:.4} - accuracy: {:.4}",
                epoch + 1,
                epochs,
                stats.duration.as_secs(),
                stats.loss,
                stats.accuracy
            );
            history.epochs.push(stats);
        }

        Ok(history)
    }

    /// Loss, accuracy and number of mistakes over the whole pipeline, in inference mode
    pub fn evaluate(&self, pipeline: &Pipeline) -> Result<Evaluation> {
        if pipeline.is_empty() {
            return Err(Error::EmptyDataset);
        }

        let mut totals = Totals::default();
        for batch in pipeline.epoch(0) {
            let batch = batch?;
            let probabilities = self.model.predict(&batch.images.view())?;
            let loss = cross_entropy(&probabilities.view(), &batch.labels);
            let correct = count_correct(&probabilities.view(), &batch.labels);
            totals.add(loss, correct, batch.labels.len());
        }

        let evaluation = Evaluation {
            loss: totals.mean_loss(),
            accuracy: totals.accuracy(),
            mistakes: totals.examples - totals.correct,
            examples: totals.examples,
        };
        tracing::info!(
            "Evaluation - loss: {:.4} - accuracy: {:.4} - mistakes: {}/{}",
            evaluation.loss,
            evaluation.accuracy,
            evaluation.mistakes,
            evaluation.examples
        );

        Ok(evaluation)
    }
}

/// Write the history in a "epoch    loss    accuracy" format
pub fn write_history(path: &Path, history: &History) -> Result<()> {
    let mut file = File::create(path).map_err(|err| Error::io(path, err))?;

    for stats in &history.epochs {
        writeln!(file, "{}    {}    {}", stats.epoch, stats.loss, stats.accuracy)
            .map_err(|err| Error::io(path, err))?;
    }

    Ok(())
}
