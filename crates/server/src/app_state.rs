use crate::api::ApiContext;
use shared::protocol::{PushEnvelope, RealtimeEvent};
use tokio::sync::broadcast;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) pushes: broadcast::Sender<PushEnvelope>,
    pub(crate) api_key: Option<String>,
}

impl AppState {
    pub(crate) fn publish_changes(&self, changes: Vec<RealtimeEvent>) {
        for change in changes {
            // No connected sockets is not an error.
            let _ = self.pushes.send(PushEnvelope::Change(change));
        }
    }
}
