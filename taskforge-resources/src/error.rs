use miette::Diagnostic;
use thiserror::Error;

use crate::kind::ResourceKind;

/// Errors that can arise while constructing a [`crate::ResourceManifest`].
#[derive(Error, Debug, Diagnostic)]
pub enum ManifestError {
    #[error("resource kind {kind:?} was supplied more than once to the same manifest")]
    DuplicateResourceKind { kind: ResourceKind },
}

/// Raised by [`crate::CancellationWatcher::throw_if_canceled`] once its trigger fires.
#[derive(Error, Debug, Diagnostic, Clone, PartialEq, Eq, Default)]
#[error("operation was canceled: {reason}")]
pub struct CanceledError {
    pub reason: String,
}
