//! Completion detection for commands running inside the opaque shell.
//!
//! The shell offers no native "command finished" event, so the session polls
//! a [`CompletionProbe`] on a fixed interval. The default probe watches the
//! status side-channel file; alternative signalling (a sentinel on a
//! dedicated stream, say) can be swapped in without touching the queue or
//! the protocol server.

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;

use super::channels::SideChannels;

/// Decides whether the command currently dispatched to the shell has finished.
pub trait CompletionProbe: Send + Sync + Debug {
    /// Return `true` once the in-flight command has recorded its completion.
    ///
    /// Probes must be cheap and must not block: they run on every poll tick.
    fn is_complete<'a>(
        &'a self,
        channels: &'a SideChannels,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;
}

/// Default probe: the status file becoming non-empty marks completion.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatusFileProbe;

impl CompletionProbe for StatusFileProbe {
    fn is_complete<'a>(
        &'a self,
        channels: &'a SideChannels,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            tokio::fs::metadata(&channels.status)
                .await
                .map(|meta| meta.len() > 0)
                .unwrap_or(false)
        })
    }
}
