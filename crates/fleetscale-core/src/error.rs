//! Error types for the reconciliation engine.

use thiserror::Error;

/// Errors from compiling or evaluating a bound expression.
#[derive(Debug, Error, PartialEq)]
pub enum ExprError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("unknown metric: {0:?}")]
    UnknownMetric(String),

    #[error("unknown function: {0:?}")]
    UnknownFunction(String),

    #[error("expression returned NaN")]
    Nan,

    #[error("expression returned Inf")]
    Inf,
}

/// Errors that abort a single reconciliation tick.
///
/// Per-machine lifecycle failures are not here: those are absorbed,
/// logged, and counted inside the tick.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("no fleet api client bound")]
    NotBound,

    #[error("collect metric {name:?}: {source}")]
    Collect {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("compute {bound} machine count: {source}")]
    Bound {
        bound: &'static str,
        #[source]
        source: ExprError,
    },

    #[error("list machines: {source}")]
    List {
        #[source]
        source: anyhow::Error,
    },

    #[error("no machine available to clone for scale up")]
    NoTemplateMachine,
}

/// Errors raised when opening a reconciler pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("app name required")]
    AppNameRequired,

    #[error("organization slug required if app name uses a wildcard")]
    OrgSlugRequired,

    #[error("fleet api client factory required")]
    ClientFactoryRequired,

    #[error("reconciler factory required")]
    ReconcilerFactoryRequired,

    #[error("cannot initialize fleet api client: {0}")]
    Client(#[source] anyhow::Error),
}
