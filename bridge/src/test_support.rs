//! Scripted collaborators for subsystem tests.

use async_trait::async_trait;
use protocol::ServerId;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::CommandError;
use crate::manager::CommandSink;
use crate::notify::{Notice, Notification, Notifier};

/// Answers commands from a script, then with a fallback.
pub struct ScriptedSink {
    script: Mutex<VecDeque<Result<String, CommandError>>>,
    fallback: Mutex<Result<String, CommandError>>,
    sent: Mutex<Vec<(ServerId, String)>>,
}

impl ScriptedSink {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Ok(String::new())),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn then(&self, response: Result<String, CommandError>) -> &Self {
        self.script.lock().unwrap().push_back(response);
        self
    }

    pub fn otherwise(&self, response: Result<String, CommandError>) {
        *self.fallback.lock().unwrap() = response;
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, text)| text.clone()).collect()
    }
}

#[async_trait]
impl CommandSink for ScriptedSink {
    async fn send_command(
        &self,
        server: &ServerId,
        text: &str,
        _timeout: Duration,
    ) -> Result<String, CommandError> {
        self.sent.lock().unwrap().push((server.clone(), text.to_string()));
        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(response) => response,
            None => self.fallback.lock().unwrap().clone(),
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.seen.lock().unwrap().iter().map(|n| n.notice.clone()).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.seen.lock().unwrap().push(notification);
    }
}

pub fn unavailable(server: &str) -> CommandError {
    CommandError::ConnectionUnavailable(ServerId::new(server))
}
