use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::storage::descriptor::DataDescriptor;
use crate::torrent::TorrentId;

/// The stages a torrent moves through.
///
/// `FetchMetadata` only appears for magnet starts; file-based starts
/// enter at `ChooseFiles`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    FetchMetadata,
    ChooseFiles,
    Download,
    Seed,
    Stop,
}

/// Events a stage transition publishes to its listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineEvent {
    TorrentFetched,
    FilesChosen,
    DownloadComplete,
}

/// Posible pipeline errors.
#[derive(Debug)]
pub enum PipelineError {
    /// The data descriptor reported itself stalled; the torrent cannot
    /// make progress.
    StorageStalled(TorrentId),
    MissingDataDescriptor(TorrentId),
}

/// What a torrent's stages operate on.
pub struct TorrentContext {
    pub torrent: TorrentId,
    pub data: Option<Arc<DataDescriptor>>,
    /// Started from a magnet link, so metadata must be fetched first.
    pub from_magnet: bool,
}

impl TorrentContext {
    pub fn new(torrent: TorrentId, data: Option<Arc<DataDescriptor>>, from_magnet: bool) -> Self {
        Self {
            torrent,
            data,
            from_magnet,
        }
    }

    pub fn initial_stage(&self) -> Stage {
        if self.from_magnet {
            Stage::FetchMetadata
        } else {
            Stage::ChooseFiles
        }
    }
}

/// A listener sees the context and the stage the pipeline would move
/// to, and returns the stage it should move to. `None` terminates.
pub type StageListener =
    Box<dyn Fn(&mut TorrentContext, Option<Stage>) -> Option<Stage> + Send + Sync>;

/// Drives a torrent through its stage chain, letting listeners splice
/// side effects into transitions and rewrite or cut them short.
///
/// Listeners of one event compose in registration order; a `None`
/// short-circuits the rest.
#[derive(Default)]
pub struct ProcessingPipeline {
    listeners: HashMap<PipelineEvent, Vec<StageListener>>,
}

impl ProcessingPipeline {
    pub fn new() -> Self {
        Self {
            listeners: HashMap::new(),
        }
    }

    /// Registers a listener for one event.
    pub fn on<F>(&mut self, event: PipelineEvent, listener: F)
    where
        F: Fn(&mut TorrentContext, Option<Stage>) -> Option<Stage> + Send + Sync + 'static,
    {
        self.listeners.entry(event).or_default().push(Box::new(listener));
    }

    /// Runs one stage and returns the stage to run next; `None` means
    /// the chain terminated.
    pub fn process(
        &self,
        stage: Stage,
        context: &mut TorrentContext,
    ) -> Result<Option<Stage>, PipelineError> {
        let next = match stage {
            Stage::FetchMetadata => {
                // The metadata source is an external collaborator; by
                // the time the pipeline runs this stage the torrent is
                // registered and fetched.
                info!("Torrent {} metadata fetched", context.torrent);
                self.dispatch(PipelineEvent::TorrentFetched, context, Some(Stage::ChooseFiles))
            }
            Stage::ChooseFiles => {
                debug!("Torrent {} files chosen", context.torrent);
                self.dispatch(PipelineEvent::FilesChosen, context, Some(Stage::Download))
            }
            Stage::Download => {
                let data = context
                    .data
                    .clone()
                    .ok_or(PipelineError::MissingDataDescriptor(context.torrent))?;
                if data.is_stalled().unwrap_or(true) {
                    return Err(PipelineError::StorageStalled(context.torrent));
                }
                if data.is_complete().unwrap_or(false) {
                    info!("Torrent {} download complete", context.torrent);
                    self.dispatch(PipelineEvent::DownloadComplete, context, Some(Stage::Seed))
                } else {
                    // Still downloading; the caller re-enters later.
                    Some(Stage::Download)
                }
            }
            Stage::Seed => Some(Stage::Seed),
            Stage::Stop => None,
        };
        Ok(next)
    }

    fn dispatch(
        &self,
        event: PipelineEvent,
        context: &mut TorrentContext,
        would_be_next: Option<Stage>,
    ) -> Option<Stage> {
        let listeners = match self.listeners.get(&event) {
            Some(listeners) => listeners,
            None => return would_be_next,
        };

        let mut next = would_be_next;
        for listener in listeners {
            next = listener(context, next);
            if next.is_none() {
                break;
            }
        }
        next
    }
}
