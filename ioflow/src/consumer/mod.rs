//! # Polling Consumer
//!
//! Single-threaded loop on the receiving end of the record transport. Each
//! wakeup drains every record currently queued, decodes it, applies the
//! per-channel threshold and writes accepted rows in arrival order. Arrival
//! order follows the pipeline, not a global time order across CPUs.
//!
//! The loop blocks on the transport and on an explicit cancellation channel,
//! with no timeout. A cancellation message (or the cancel sender being
//! dropped) stops the loop; records still queued are not rendered. The final
//! histograms are written after the loop ends.

pub mod event;
pub mod filter;
pub mod render;

use crossbeam_channel::{select, Receiver};
use log::{debug, warn};
use std::io::{self, Write};
use std::sync::Arc;

pub use event::{BioEvent, Event, IoEvent, RequestEvent};
pub use filter::{Filter, Threshold};
pub use render::{HistogramLayout, Renderer, RowLayout, SyscallColumns};

use crate::emitter::OutputRecord;
use crate::histogram::HistogramSet;

/// Consumer-side counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub rendered: u64,
    pub malformed: u64,
}

/// Drains the transport and renders to `W`
pub struct PollingConsumer<W: Write> {
    records: Receiver<OutputRecord>,
    cancel: Receiver<()>,
    filter: Filter,
    renderer: Renderer,
    histograms: Arc<HistogramSet>,
    histogram_layout: HistogramLayout,
    out: W,
    stats: ConsumerStats,
}

impl<W: Write> PollingConsumer<W> {
    #[must_use]
    pub fn new(
        records: Receiver<OutputRecord>,
        cancel: Receiver<()>,
        filter: Filter,
        rows: RowLayout,
        histograms: Arc<HistogramSet>,
        histogram_layout: HistogramLayout,
        out: W,
    ) -> Self {
        Self {
            records,
            cancel,
            filter,
            renderer: Renderer::new(rows),
            histograms,
            histogram_layout,
            out,
            stats: ConsumerStats::default(),
        }
    }

    /// Run until cancelled or until every producer is gone, then render the
    /// histograms
    ///
    /// # Errors
    /// Returns the first write error on the output
    pub fn run(&mut self) -> io::Result<ConsumerStats> {
        loop {
            select! {
                recv(self.records) -> msg => match msg {
                    Ok(record) => {
                        self.accept(&record)?;
                        while let Ok(record) = self.records.try_recv() {
                            self.accept(&record)?;
                        }
                        self.out.flush()?;
                    }
                    Err(_) => {
                        debug!("record transport closed");
                        break;
                    }
                },
                recv(self.cancel) -> _ => break,
            }
        }

        self.histogram_layout.write_histograms(&self.histograms, &mut self.out)?;
        Ok(self.stats)
    }

    fn accept(&mut self, record: &OutputRecord) -> io::Result<()> {
        self.stats.received += 1;
        let event = match Event::decode(record) {
            Ok(event) => event,
            Err(e) => {
                self.stats.malformed += 1;
                warn!("Dropping undecodable record: {e}");
                return Ok(());
            }
        };

        // Below threshold: discarded silently
        if !self.filter.admits(&event) {
            return Ok(());
        }
        if let Some(row) = self.renderer.render(&event) {
            writeln!(self.out, "{row}")?;
            self.stats.rendered += 1;
        }
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    /// Hand back the output sink
    pub fn into_inner(self) -> W {
        self.out
    }
}
