use std::fmt::Display;

use tracing_error::SpanTrace;

/// An error kind paired with the tracing span active when it was raised.
///
/// Every module exposes its own `XErrorKind` enum and aliases `XError = KFError<XErrorKind>`.
/// Failures inside background units are raised under the instrumented provider call, so the
/// context shows which dataset and which logical path a joined error came from, even though
/// it is reported later by `wait_ready` or `download`. The context is only populated when
/// `tracing_error::ErrorLayer` is installed (see `initialize_tracing`).
#[derive(Debug)]
pub struct KFError<E> {
    pub kind: E,
    pub context: SpanTrace,
}

impl<E> KFError<E> {
    pub fn new(kind: E) -> Self {
        Self::with_context(kind, SpanTrace::capture())
    }

    pub fn with_context(kind: E, context: SpanTrace) -> Self {
        Self { kind, context }
    }

    pub fn kind(&self) -> &E {
        &self.kind
    }

    pub fn span(&self) -> &SpanTrace {
        &self.context
    }

    /// Convert into another error family, keeping the original span.
    pub fn map_kind<F>(self, f: impl FnOnce(E) -> F) -> KFError<F> {
        KFError::with_context(f(self.kind), self.context)
    }
}

impl<E: Display> std::fmt::Display for KFError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.kind.fmt(f)?;
        write!(f, "\n\ncontext:\n{}\n", self.context)?;
        Ok(())
    }
}

impl<E: std::error::Error + 'static> std::error::Error for KFError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}
