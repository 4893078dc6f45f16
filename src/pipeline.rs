//! Load, reconstruct, normalize, deduplicate, with the cache around it.
//!
//! The three record kinds are loaded by scoped producer threads feeding
//! bounded channels. The calling thread is the only consumer: it owns the
//! lookup maps while draining, and reconstruction starts only once every
//! producer has finished.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{SendTimeoutError, Sender, bounded, never, select};

use crate::cache::CacheManager;
use crate::dedup::deduplicate;
use crate::error::{PipelineError, StorageError};
use crate::normalize::{Session, normalize};
use crate::reconstruct::reconstruct_all;
use crate::records::{Bubble, Composer, MessageContext};
use crate::storage::{Sink, StorageBackend, select_source};
use crate::utils::{RunConfig, short_id};
use crate::workspace::{Workspace, associate, load_workspaces};

const CHANNEL_CAPACITY: usize = 256;
const SEND_TIMEOUT: Duration = Duration::from_millis(50);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cooperative cancellation with an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::default(),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn check(&self) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Everything read from one backend.
#[derive(Debug, Default)]
pub struct LoadedRecords {
    pub bubbles: HashMap<String, Bubble>,
    pub composers: Vec<Composer>,
    pub contexts: HashMap<String, Vec<MessageContext>>,
}

/// Forward every scanned record into `tx`, giving up once `stop` is set or
/// the consumer has gone away.
fn produce<T>(
    tx: Sender<T>,
    stop: &AtomicBool,
    scan: impl FnOnce(Sink<'_, T>) -> Result<(), StorageError>,
) -> Result<usize, StorageError> {
    let mut sent = 0usize;
    scan(&mut |item: T| {
        let mut pending = item;
        loop {
            if stop.load(Ordering::Relaxed) {
                return ControlFlow::Break(());
            }
            match tx.send_timeout(pending, SEND_TIMEOUT) {
                Ok(()) => {
                    sent += 1;
                    return ControlFlow::Continue(());
                }
                Err(SendTimeoutError::Disconnected(_)) => return ControlFlow::Break(()),
                Err(SendTimeoutError::Timeout(r)) => pending = r,
            }
        }
    })?;
    Ok(sent)
}

fn join<T>(handle: std::thread::ScopedJoinHandle<'_, T>) -> T {
    match handle.join() {
        Ok(v) => v,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Load all three record kinds concurrently.
pub fn load_concurrent(
    backend: &dyn StorageBackend,
    cancel: &CancelToken,
) -> Result<LoadedRecords, PipelineError> {
    let stop = AtomicBool::new(false);
    let mut records = LoadedRecords::default();

    std::thread::scope(|s| {
        let (b_tx, mut b_rx) = bounded::<Bubble>(CHANNEL_CAPACITY);
        let (c_tx, mut c_rx) = bounded::<Composer>(CHANNEL_CAPACITY);
        let (x_tx, mut x_rx) = bounded::<MessageContext>(CHANNEL_CAPACITY);
        let stop = &stop;

        let bubbles = s.spawn(move || produce(b_tx, stop, |sink| backend.for_each_bubble(sink)));
        let composers = s.spawn(move || produce(c_tx, stop, |sink| backend.for_each_composer(sink)));
        let contexts = s.spawn(move || produce(x_tx, stop, |sink| backend.for_each_context(sink)));

        let mut open = 3;
        let mut cancelled = false;
        while open > 0 {
            if cancel.is_cancelled() {
                stop.store(true, Ordering::Relaxed);
                cancelled = true;
                break;
            }
            let mut closed = None;
            select! {
                recv(b_rx) -> msg => match msg {
                    Ok(b) => {
                        records.bubbles.insert(b.id.clone(), b);
                    }
                    Err(_) => closed = Some(0),
                },
                recv(c_rx) -> msg => match msg {
                    Ok(c) => records.composers.push(c),
                    Err(_) => closed = Some(1),
                },
                recv(x_rx) -> msg => match msg {
                    Ok(ctx) => records.contexts.entry(ctx.composer_id.clone()).or_default().push(ctx),
                    Err(_) => closed = Some(2),
                },
                default(POLL_INTERVAL) => {}
            }
            // A disconnected receiver is always ready; park it on `never`.
            match closed {
                Some(0) => b_rx = never(),
                Some(1) => c_rx = never(),
                Some(_) => x_rx = never(),
                None => continue,
            }
            open -= 1;
        }
        drop((b_rx, c_rx, x_rx));

        let counts = (join(bubbles), join(composers), join(contexts));
        if cancelled {
            return Err(PipelineError::Cancelled);
        }
        let (b, c, x) = (counts.0?, counts.1?, counts.2?);
        tracing::info!(bubbles = b, composers = c, contexts = x, "records loaded");
        Ok(())
    })?;

    Ok(records)
}

/// Load the three record kinds one after another on the calling thread.
pub fn load_sequential(
    backend: &dyn StorageBackend,
    cancel: &CancelToken,
) -> Result<LoadedRecords, PipelineError> {
    let bubbles = backend.load_bubbles()?;
    cancel.check()?;
    let composers = backend.load_composers()?;
    cancel.check()?;
    let contexts = backend.load_message_contexts()?;
    cancel.check()?;
    tracing::info!(
        bubbles = bubbles.len(),
        composers = composers.len(),
        "records loaded"
    );
    Ok(LoadedRecords {
        bubbles,
        composers,
        contexts,
    })
}

/// Reconstruct, normalize, order and deduplicate.
///
/// Sessions are ordered by most recent activity, then id, before
/// deduplication, so the newest copy of a duplicated conversation is kept.
pub fn build_sessions(records: &LoadedRecords, source: &str, workspaces: &[Workspace]) -> Vec<Session> {
    let conversations = reconstruct_all(&records.composers, &records.bubbles, &records.contexts);

    let mut sessions: Vec<Session> = conversations
        .iter()
        .filter_map(|conv| {
            let contexts = records
                .contexts
                .get(&conv.composer_id)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let workspace = associate(&conv.composer_id, contexts, workspaces);
            match normalize(Some(conv), &workspace, source) {
                Ok(s) => Some(s),
                Err(e) => {
                    tracing::debug!(composer = %short_id(&conv.composer_id, 8), error = %e, "skipping conversation");
                    None
                }
            }
        })
        .collect();

    sessions.sort_by(|a, b| {
        b.last_activity()
            .cmp(&a.last_activity())
            .then_with(|| a.id.cmp(&b.id))
    });
    deduplicate(sessions)
}

pub struct Pipeline<'a> {
    config: &'a RunConfig,
    cancel: CancelToken,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a RunConfig, cancel: CancelToken) -> Self {
        Self { config, cancel }
    }

    fn cache(&self) -> Option<CacheManager> {
        self.config.cache_dir.as_deref().map(CacheManager::new)
    }

    fn workspaces(&self) -> Vec<Workspace> {
        self.config
            .workspace_storage
            .as_deref()
            .map(load_workspaces)
            .unwrap_or_default()
    }

    /// Run the full reconstruction against the selected source.
    fn rebuild(&self, backend: &dyn StorageBackend) -> Result<Vec<Session>, PipelineError> {
        let records = if self.config.sequential {
            load_sequential(backend, &self.cancel)?
        } else {
            load_concurrent(backend, &self.cancel)?
        };
        self.cancel.check()?;

        let sessions = build_sessions(&records, backend.source_tag(), &self.workspaces());
        self.cancel.check()?;
        tracing::info!(
            sessions = sessions.len(),
            source = %backend.location().display(),
            "reconstruction finished"
        );
        Ok(sessions)
    }

    /// Every session, from the cache when it is still valid.
    pub fn sessions(&self) -> Result<Vec<Session>, PipelineError> {
        let source = select_source(&self.config.locations)?;
        let cache = self.cache();

        if let Some(cache) = &cache
            && cache.is_cache_valid(source.path())
            && let Some(sessions) = cache.load_all_sessions()
        {
            tracing::info!(count = sessions.len(), "using cached sessions");
            return Ok(sessions);
        }

        let backend = source.open()?;
        let sessions = self.rebuild(backend.as_ref())?;

        if let Some(cache) = &cache
            && let Err(e) = cache.save_sessions(&sessions, source.path())
        {
            tracing::warn!(error = %e, "could not write cache");
        }
        Ok(sessions)
    }

    /// One session by exact id.
    ///
    /// A rebuild replaces a stale cache with every session it produced; a
    /// valid cache that merely lacked `id` gets that one session upserted.
    pub fn find_session(&self, id: &str) -> Result<Session, PipelineError> {
        let source = select_source(&self.config.locations)?;
        let cache = self.cache();
        let valid = cache.as_ref().is_some_and(|c| c.is_cache_valid(source.path()));

        if let Some(cache) = &cache
            && valid
            && let Some(session) = cache.load_session(id)
        {
            tracing::debug!(session = %short_id(id, 8), "cache hit");
            return Ok(session);
        }

        let backend = source.open()?;
        let mut sessions = self.rebuild(backend.as_ref())?;
        let found = sessions.iter().position(|s| s.id == id);

        if let Some(cache) = &cache {
            let saved = match found {
                _ if !valid => cache.save_sessions(&sessions, source.path()),
                Some(i) => cache.save_session_and_update_index(&sessions[i], source.path()),
                None => Ok(()),
            };
            if let Err(e) = saved {
                tracing::warn!(error = %e, "could not update cache");
            }
        }

        let scanned = sessions.len();
        match found {
            Some(i) => Ok(sessions.swap_remove(i)),
            None => Err(PipelineError::SessionNotFound {
                id: id.to_string(),
                scanned,
            }),
        }
    }
}
