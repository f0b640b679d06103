use tokio_util::sync::CancellationToken;
use crate::net::Destination;

/// Per-connection state threaded explicitly through the dispatch path.
#[derive(Clone, Debug)]
pub struct DispatchContext {
    pub source: Option<Destination>,
    pub target: Option<Destination>,
    pub user_level: u32,
    pub cancel: CancellationToken,
}

impl Default for DispatchContext {
    fn default() -> Self {
        Self {
            source: None,
            target: None,
            user_level: 0,
            cancel: CancellationToken::new(),
        }
    }
}

impl DispatchContext {
    pub fn with_target(target: Destination) -> Self {
        Self {
            target: Some(target),
            ..Self::default()
        }
    }

    /// Derived context for an inner stream, sharing the cancellation scope.
    pub fn child_with_target(&self, target: Destination) -> Self {
        Self {
            target: Some(target),
            ..self.clone()
        }
    }
}
