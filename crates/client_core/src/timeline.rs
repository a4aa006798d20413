use shared::protocol::Message;

/// Append-only merge of the historical page and the live stream for one
/// room. The two sources feed it independently: history installs once,
/// live frames append repeatedly in exact arrival order. Nothing is
/// reordered retroactively and no key-based dedup is performed; history
/// is always older than anything received after room entry.
#[derive(Debug, Default)]
pub struct Timeline {
    messages: Vec<Message>,
    history_installed: bool,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the historical page (already chronological). Live
    /// messages that arrived first stay after it. A second install is
    /// ignored; history is fetched once per room entry.
    pub fn install_history(&mut self, history: Vec<Message>) {
        if self.history_installed {
            return;
        }
        self.history_installed = true;
        if self.messages.is_empty() {
            self.messages = history;
        } else {
            let buffered_live = std::mem::replace(&mut self.messages, history);
            self.messages.extend(buffered_live);
        }
    }

    pub fn append_live(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn history_installed(&self) -> bool {
        self.history_installed
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }
}
