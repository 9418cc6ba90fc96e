//! Batching stage: accumulates items until an end-of-burst marker.
//!
//! On [`Marked::EndOfBurst`] the pending items are handed to the flush
//! function as one batch; its result is emitted followed by the marker, so
//! stages further down still see where the burst ended.

use crate::pipeline::{Marked, Stage, StageContext, StageError};

pub struct Batcher<T, F> {
    name: String,
    pending: Vec<T>,
    flush: F,
}

impl<T, F> Batcher<T, F>
where
    F: FnMut(Vec<T>) -> Result<Vec<T>, StageError>,
{
    pub fn new(name: impl Into<String>, flush: F) -> Self {
        Self {
            name: name.into(),
            pending: Vec::new(),
            flush,
        }
    }

    /// Items waiting for the next marker.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl<T, F> Stage<Marked<T>> for Batcher<T, F>
where
    T: Send,
    F: FnMut(Vec<T>) -> Result<Vec<T>, StageError> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(
        &mut self,
        item: Marked<T>,
        ctx: &mut StageContext<'_, Marked<T>>,
    ) -> Result<(), StageError> {
        match item {
            Marked::Item(item) => {
                self.pending.push(item);
                Ok(())
            }
            Marked::EndOfBurst => {
                let batch = std::mem::take(&mut self.pending);
                tracing::debug!("Batcher '{}' flushing {} item(s)", self.name, batch.len());
                let flushed = (self.flush)(batch)?;
                ctx.emit_all(flushed.into_iter().map(Marked::Item))?;
                ctx.emit(Marked::EndOfBurst)?;
                Ok(())
            }
        }
    }

    fn on_stop(&mut self) {
        if !self.pending.is_empty() {
            tracing::warn!(
                "Batcher '{}' stopped with {} unflushed item(s)",
                self.name,
                self.pending.len()
            );
        }
    }
}
