//! End-of-burst markers.
//!
//! A stage that wants downstream to know where a burst ends emits
//! [`Marked::EndOfBurst`] after its items. Downstream batching stages flush
//! on the marker. To the handoff protocol the marker is an ordinary item.

use crate::config::StageConfig;
use crate::pipeline::error::{PipelineResult, StageError};
use crate::pipeline::stage::{BurstSink, Stage, StageContext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marked<T> {
    Item(T),
    EndOfBurst,
}

impl<T> Marked<T> {
    pub fn is_end_of_burst(&self) -> bool {
        matches!(self, Marked::EndOfBurst)
    }

    pub fn as_item(&self) -> Option<&T> {
        match self {
            Marked::Item(item) => Some(item),
            Marked::EndOfBurst => None,
        }
    }

    pub fn into_item(self) -> Option<T> {
        match self {
            Marked::Item(item) => Some(item),
            Marked::EndOfBurst => None,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Marked<U> {
        match self {
            Marked::Item(item) => Marked::Item(f(item)),
            Marked::EndOfBurst => Marked::EndOfBurst,
        }
    }
}

impl<T> From<T> for Marked<T> {
    fn from(item: T) -> Self {
        Marked::Item(item)
    }
}

/// Wraps a plain stage so each of its bursts ends with [`Marked::EndOfBurst`].
///
/// Incoming markers pass through untouched; the wrapped stage never sees them.
pub struct MarkBursts<S> {
    inner: S,
}

impl<S> MarkBursts<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

struct ItemSink<'c, 'a, T> {
    ctx: &'c mut StageContext<'a, Marked<T>>,
    emitted: usize,
}

impl<T> BurstSink<T> for ItemSink<'_, '_, T> {
    fn emit(&mut self, item: T) -> PipelineResult<()> {
        self.ctx.emit(Marked::Item(item))?;
        self.emitted += 1;
        Ok(())
    }

    fn emitted(&self) -> usize {
        self.emitted
    }
}

impl<T, S> Stage<Marked<T>> for MarkBursts<S>
where
    S: Stage<T>,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn process(
        &mut self,
        item: Marked<T>,
        ctx: &mut StageContext<'_, Marked<T>>,
    ) -> Result<(), StageError> {
        let item = match item {
            Marked::Item(item) => item,
            Marked::EndOfBurst => {
                ctx.emit(Marked::EndOfBurst)?;
                return Ok(());
            }
        };

        let config = ctx.config();
        let sequence = ctx.sequence();
        let mut sink = ItemSink { ctx, emitted: 0 };
        {
            let mut inner_ctx = StageContext::new(config, sequence, &mut sink);
            self.inner.process(item, &mut inner_ctx)?;
        }
        sink.ctx.emit(Marked::EndOfBurst)?;
        Ok(())
    }

    fn on_start(&mut self, config: &StageConfig) {
        self.inner.on_start(config);
    }

    fn on_stop(&mut self) {
        self.inner.on_stop();
    }
}
