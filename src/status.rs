use std::fmt::{Display, Formatter};

use crate::error::LoadError;

/// Load status of a deferred resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoadStatus {
    #[default]
    NotLoaded,
    Loading,
    Loaded,
    FailedToLoad,
}

impl LoadStatus {
    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `Loading -> Loading` is the retry of an attempt that is still in flight.
    pub fn can_transition_to(self, next: LoadStatus) -> bool {
        use LoadStatus::*;
        matches!(
            (self, next),
            (NotLoaded, Loading)
                | (Loading, Loading)
                | (Loading, Loaded)
                | (Loading, FailedToLoad)
                | (Loaded, Loading)
                | (FailedToLoad, Loading)
        )
    }

    pub fn is_loading(self) -> bool {
        self == LoadStatus::Loading
    }
}

impl Display for LoadStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoadStatus::NotLoaded => "not loaded",
            LoadStatus::Loading => "loading",
            LoadStatus::Loaded => "loaded",
            LoadStatus::FailedToLoad => "failed to load",
        };
        f.write_str(s)
    }
}

/// Status and error of a lifecycle at one point in time.
///
/// `error` is `Some` exactly when `status` is [`LoadStatus::FailedToLoad`].
#[derive(Debug, Clone, Default)]
pub struct LoadSnapshot {
    pub status: LoadStatus,
    pub error: Option<LoadError>,
}
