//! Concurrent multi-resource fetch for one patient

mod coordinator;
mod result;

pub use coordinator::{
    ConcurrentFetchCoordinator, DEFAULT_OBSERVATION_CATEGORY, FetchRequest, patient_search_request,
};
pub use result::FetchResult;
