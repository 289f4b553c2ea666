mod abort;
mod counter;
mod error;
mod result;

pub mod prelude {
    pub use crate::abort::{AbortHandle, AbortListener, AbortSignalError, AbortState};
    pub use crate::counter::IterationCounter;
    pub use crate::error::{IterationTimeoutError, NamedError};
    pub use crate::result::{
        now_timestamp, AtomicAction, IterationError, IterationResult, Output, OutputChart,
        ResultBatch,
    };
}
