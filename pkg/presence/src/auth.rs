use tokio::sync::watch;

/// Session state supplied by the authentication layer.
pub trait AuthSource: Send + Sync {
    /// Becomes `true` once auth has settled, and stays `true`.
    fn auth_ready(&self) -> watch::Receiver<bool>;

    /// The signed-in identity, `None` when signed out.
    fn identity(&self) -> watch::Receiver<Option<String>>;
}

/// Auth source driven by explicit calls.
pub struct ManualAuth {
    ready: watch::Sender<bool>,
    identity: watch::Sender<Option<String>>,
}

impl ManualAuth {
    pub fn new() -> Self {
        Self {
            ready: watch::Sender::new(false),
            identity: watch::Sender::new(None),
        }
    }

    pub fn mark_ready(&self) {
        self.ready.send_replace(true);
    }

    pub fn sign_in(&self, identity_id: &str) {
        self.identity.send_replace(Some(identity_id.to_string()));
    }

    pub fn sign_out(&self) {
        self.identity.send_replace(None);
    }
}

impl Default for ManualAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthSource for ManualAuth {
    fn auth_ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    fn identity(&self) -> watch::Receiver<Option<String>> {
        self.identity.subscribe()
    }
}
